//! Per-host request pacing.
//!
//! Spaces consecutive requests to the same host by a random gap in
//! `[min_delay, max_delay]` plus jitter, and inserts an extra pause once a
//! host has seen `burst_threshold` requests inside `burst_window`.
//!
//! Slots are reserved under the lock and slept on outside it, so concurrent
//! callers for one host queue up behind each other while other hosts are
//! unaffected.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use harvester_core::pacing::{Pacer, PacingConfig};
//!
//! # async fn run() -> Result<(), harvester_core::AppError> {
//! let pacer = Pacer::new(PacingConfig::default());
//! let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
//! pacer.wait_turn("example.com", deadline).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::error::AppError;
use crate::util;

/// Configuration for the pacer.
#[derive(Debug, Clone)]
pub struct PacingConfig {
    /// Lower bound of the gap between requests to one host.
    pub min_delay: Duration,

    /// Upper bound of the gap between requests to one host.
    pub max_delay: Duration,

    /// Extra uniform noise on top of the gap. `Duration::ZERO` disables it.
    pub jitter: Duration,

    /// Requests within `burst_window` that trigger a burst pause (0 = off).
    pub burst_threshold: usize,

    pub burst_window: Duration,

    /// Pause inserted when the burst threshold is reached.
    pub burst_delay: Duration,
}

impl PacingConfig {
    /// No pacing at all.
    pub fn disabled() -> Self {
        Self {
            min_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: Duration::ZERO,
            burst_threshold: 0,
            burst_window: Duration::ZERO,
            burst_delay: Duration::ZERO,
        }
    }

    fn gap(&self) -> Duration {
        util::between(self.min_delay, self.max_delay).saturating_add(util::jitter(self.jitter))
    }
}

impl Default for PacingConfig {
    /// 1-3s between requests plus up to 500ms jitter; a 10s pause after
    /// 5 requests within a minute.
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(3000),
            jitter: Duration::from_millis(500),
            burst_threshold: 5,
            burst_window: Duration::from_secs(60),
            burst_delay: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct HostState {
    /// Start time of the latest reserved request.
    last: Option<Instant>,
    /// Start times of requests inside the burst window.
    recent: VecDeque<Instant>,
}

/// Per-host pacer shared by all in-flight tasks.
#[derive(Debug)]
pub struct Pacer {
    config: PacingConfig,
    hosts: Mutex<HashMap<String, HostState>>,
}

impl Pacer {
    pub fn new(config: PacingConfig) -> Self {
        Self {
            config,
            hosts: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &PacingConfig {
        &self.config
    }

    /// Reserves the next slot for `host` and sleeps until it starts.
    ///
    /// Fails with `Timeout` without consuming the slot when it would start
    /// after `deadline`.
    pub async fn wait_turn(&self, host: &str, deadline: Instant) -> Result<(), AppError> {
        let now = Instant::now();
        let slot = {
            let mut hosts = self.hosts.lock().await;
            let state = hosts.entry(host.to_string()).or_default();

            let mut slot = match state.last {
                Some(last) => util::instant_after(last, self.config.gap()).max(now),
                None => now,
            };

            if self.config.burst_threshold > 0 {
                let window = self.config.burst_window;
                state
                    .recent
                    .retain(|&t| slot.checked_duration_since(t).is_none_or(|age| age < window));
                if state.recent.len() >= self.config.burst_threshold {
                    tracing::debug!(
                        host = %host,
                        recent = state.recent.len(),
                        burst_delay_ms = self.config.burst_delay.as_millis() as u64,
                        "Burst threshold reached, pausing"
                    );
                    slot = util::instant_after(slot, self.config.burst_delay);
                    state.recent.clear();
                }
            }

            if slot > deadline {
                return Err(AppError::timeout("pacing", now.elapsed()));
            }

            state.last = Some(slot);
            state.recent.push_back(slot);
            slot
        };

        if slot > now {
            tracing::debug!(
                host = %host,
                sleep_ms = (slot - now).as_millis() as u64,
                "Pacing request"
            );
            tokio::time::sleep_until(slot).await;
        }
        Ok(())
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new(PacingConfig::default())
    }
}
