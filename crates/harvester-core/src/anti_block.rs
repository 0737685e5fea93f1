//! Block detection and adaptive cooldown.
//!
//! Responses are classified from three independent signal classes: block
//! phrases in the content, challenge/login redirect paths in the final URL,
//! and throttling/denial status codes. Unusually small content only ever
//! corroborates another signal.
//!
//! # Cooldown
//!
//! ```text
//! block #n  -->  cooldown = min(initial * multiplier^(n-1), max)
//! success streak >= reset_after_successes  -->  count = 0, cooldown = initial
//! ```
//!
//! `is_in_cooldown` is evaluated lazily from `last_block_at`; nothing is
//! scheduled.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use crate::models::PageSnapshot;
use crate::util;

/// Classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Clear,
    Suspicious,
    Blocked,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Clear => write!(f, "clear"),
            Verdict::Suspicious => write!(f, "suspicious"),
            Verdict::Blocked => write!(f, "blocked"),
        }
    }
}

/// Individual evidence found in a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSignal {
    Phrase(String),
    ChallengeUrl(String),
    Status(u16),
    SmallContent(usize),
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSignal::Phrase(p) => write!(f, "phrase '{p}'"),
            BlockSignal::ChallengeUrl(p) => write!(f, "redirect to '{p}'"),
            BlockSignal::Status(s) => write!(f, "HTTP {s}"),
            BlockSignal::SmallContent(n) => write!(f, "{n} byte body"),
        }
    }
}

/// Classification of one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub verdict: Verdict,
    pub signals: Vec<BlockSignal>,
}

impl Detection {
    pub fn summary(&self) -> String {
        if self.signals.is_empty() {
            return self.verdict.to_string();
        }
        let parts: Vec<String> = self.signals.iter().map(ToString::to_string).collect();
        format!("{} ({})", self.verdict, parts.join(", "))
    }
}

/// Configuration for the anti-block detector.
#[derive(Debug, Clone)]
pub struct AntiBlockConfig {
    /// Lower-case phrases that indicate a challenge or block page.
    pub block_phrases: Vec<String>,

    /// Lower-case URL path fragments of challenge/login/auth walls.
    pub challenge_paths: Vec<String>,

    /// Status codes indicating throttling or denial.
    pub block_status_codes: Vec<u16>,

    /// Bodies shorter than this corroborate other signals.
    pub min_content_length: usize,

    /// Cooldown after the first block.
    pub initial_cooldown: Duration,

    /// Upper clamp for the cooldown.
    pub max_cooldown: Duration,

    /// Growth factor per consecutive block.
    pub backoff_multiplier: f64,

    /// Successes in a row that reset the block counter (0 = never).
    pub reset_after_successes: u32,
}

impl Default for AntiBlockConfig {
    fn default() -> Self {
        Self {
            block_phrases: [
                "captcha",
                "are you a robot",
                "unusual traffic",
                "access denied",
                "too many requests",
                "rate limit",
                "verify you are human",
                "checking your browser",
                "security check",
                "temporarily blocked",
                "please sign in to continue",
                "authwall",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            challenge_paths: [
                "/checkpoint",
                "/challenge",
                "/captcha",
                "/authwall",
                "/login",
                "/signin",
                "/uas/login",
                "/cdn-cgi/challenge-platform",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            block_status_codes: vec![401, 403, 429],
            min_content_length: 512,
            initial_cooldown: Duration::from_secs(5),
            max_cooldown: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            reset_after_successes: 3,
        }
    }
}

impl AntiBlockConfig {
    /// Cooldown applied after the `count`-th consecutive block.
    pub fn cooldown_for(&self, count: u32) -> Duration {
        if count == 0 {
            return Duration::ZERO;
        }
        let exponent = (count - 1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_cooldown.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.max_cooldown.as_secs_f64() {
            return self.max_cooldown;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Process-wide block state. Only mutated through the detector.
#[derive(Debug, Clone, PartialEq)]
pub struct AntiBlockState {
    pub consecutive_block_count: u32,
    pub last_block_at: Option<Instant>,
    pub current_cooldown: Duration,
    pub success_streak: u32,
}

impl AntiBlockState {
    fn new(config: &AntiBlockConfig) -> Self {
        Self {
            consecutive_block_count: 0,
            last_block_at: None,
            current_cooldown: config.initial_cooldown,
            success_streak: 0,
        }
    }

    fn cooldown_remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_block_at?;
        let elapsed = now.duration_since(last);
        (elapsed < self.current_cooldown).then(|| self.current_cooldown - elapsed)
    }
}

/// Severity tier derived from the consecutive block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    fn from_count(count: u32) -> Self {
        match count {
            0 => Severity::None,
            1 => Severity::Low,
            2..=3 => Severity::Medium,
            4..=5 => Severity::High,
            _ => Severity::Critical,
        }
    }
}

/// Reporting view of the detector.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AntiBlockReport {
    pub consecutive_block_count: u32,
    pub in_cooldown: bool,
    pub cooldown_remaining_ms: u64,
    pub current_cooldown_ms: u64,
    pub severity: Severity,
    pub recommendations: Vec<String>,
}

/// Thread-safe classifier plus cooldown state machine.
#[derive(Debug)]
pub struct AntiBlockDetector {
    config: AntiBlockConfig,
    state: Mutex<AntiBlockState>,
}

impl AntiBlockDetector {
    pub fn new(config: AntiBlockConfig) -> Self {
        let state = AntiBlockState::new(&config);
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    pub fn config(&self) -> &AntiBlockConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, AntiBlockState> {
        self.state.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned anti-block mutex");
            poisoned.into_inner()
        })
    }

    /// Classifies a raw page outcome. Pure; does not touch state.
    pub fn classify(&self, page: &PageSnapshot) -> Detection {
        let mut signals = Vec::new();

        let content = page.content.to_lowercase();
        let phrase = self
            .config
            .block_phrases
            .iter()
            .find(|p| !p.is_empty() && content.contains(p.as_str()));
        if let Some(p) = phrase {
            signals.push(BlockSignal::Phrase(p.clone()));
        }

        let path = url::Url::parse(&page.final_url)
            .map(|u| u.path().to_lowercase())
            .unwrap_or_else(|_| page.final_url.to_lowercase());
        let challenge = self
            .config
            .challenge_paths
            .iter()
            .find(|p| !p.is_empty() && path.contains(p.as_str()));
        if let Some(p) = challenge {
            signals.push(BlockSignal::ChallengeUrl(p.clone()));
        }

        if let Some(status) = page.status
            && self.config.block_status_codes.contains(&status)
        {
            signals.push(BlockSignal::Status(status));
        }

        let classes = signals.len();
        let small = page.content.trim().len() < self.config.min_content_length;
        if small && classes > 0 {
            signals.push(BlockSignal::SmallContent(page.content.trim().len()));
        }

        let verdict = match (classes, small) {
            (0, _) => Verdict::Clear,
            (1, false) => Verdict::Suspicious,
            _ => Verdict::Blocked,
        };

        Detection { verdict, signals }
    }

    /// Transition on a `blocked` verdict. Returns the new cooldown.
    pub fn record_block(&self) -> Duration {
        let mut state = self.lock_state();
        state.consecutive_block_count = state.consecutive_block_count.saturating_add(1);
        state.last_block_at = Some(Instant::now());
        state.success_streak = 0;

        let next = self.config.cooldown_for(state.consecutive_block_count);
        // Non-decreasing until an explicit reset.
        state.current_cooldown = next.max(state.current_cooldown).min(self.config.max_cooldown);

        tracing::warn!(
            blocks = state.consecutive_block_count,
            cooldown_ms = state.current_cooldown.as_millis() as u64,
            "Block detected, cooldown escalated"
        );
        state.current_cooldown
    }

    /// Transition on a clear success. Applies the success-streak reset policy.
    pub fn record_success(&self) {
        let mut state = self.lock_state();
        state.success_streak = state.success_streak.saturating_add(1);

        if self.config.reset_after_successes > 0
            && state.success_streak >= self.config.reset_after_successes
            && state.consecutive_block_count > 0
        {
            tracing::info!(
                streak = state.success_streak,
                previous_blocks = state.consecutive_block_count,
                "Success streak reached, resetting block counter"
            );
            state.consecutive_block_count = 0;
            state.current_cooldown = self.config.initial_cooldown;
        }
    }

    pub fn is_in_cooldown(&self) -> bool {
        self.cooldown_remaining().is_some()
    }

    pub fn cooldown_remaining(&self) -> Option<Duration> {
        self.lock_state().cooldown_remaining(Instant::now())
    }

    /// Instant at which the current cooldown ends, if one is active.
    pub fn cooldown_until(&self) -> Option<Instant> {
        let now = Instant::now();
        self.lock_state()
            .cooldown_remaining(now)
            .map(|remaining| util::instant_after(now, remaining))
    }

    pub fn state(&self) -> AntiBlockState {
        self.lock_state().clone()
    }

    pub fn reset(&self) {
        let mut state = self.lock_state();
        tracing::info!("Anti-block state manually reset");
        *state = AntiBlockState::new(&self.config);
    }

    pub fn report(&self) -> AntiBlockReport {
        let now = Instant::now();
        let state = self.lock_state();
        let remaining = state.cooldown_remaining(now);
        let severity = Severity::from_count(state.consecutive_block_count);

        AntiBlockReport {
            consecutive_block_count: state.consecutive_block_count,
            in_cooldown: remaining.is_some(),
            cooldown_remaining_ms: remaining.map_or(0, |d| d.as_millis() as u64),
            current_cooldown_ms: state.current_cooldown.as_millis() as u64,
            severity,
            recommendations: recommendations(severity, remaining.is_some()),
        }
    }
}

impl Default for AntiBlockDetector {
    fn default() -> Self {
        Self::new(AntiBlockConfig::default())
    }
}

fn recommendations(severity: Severity, in_cooldown: bool) -> Vec<String> {
    let mut out: Vec<&str> = match severity {
        Severity::None => vec![],
        Severity::Low => vec!["rotate to a different egress proxy"],
        Severity::Medium => vec![
            "rotate to a different egress proxy",
            "refresh the browsing session and cookies",
        ],
        Severity::High => vec![
            "rotate to a different egress proxy",
            "refresh the browsing session and cookies",
            "increase the inter-request delay",
        ],
        Severity::Critical => vec![
            "pause extraction against this target",
            "replace the proxy pool; current egress paths appear flagged",
            "increase the inter-request delay",
        ],
    };
    if in_cooldown {
        out.push("wait for the cooldown window to pass before retrying");
    }
    out.into_iter().map(String::from).collect()
}
