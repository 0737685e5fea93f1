//! Egress proxy rotation with health tracking and quarantine.
//!
//! Quarantine is lifted purely by comparing `quarantined_until` against the
//! clock at selection time; nothing runs in the background.

use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::util;

/// Scheme used to talk to the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyProtocol {
    #[default]
    Http,
    Https,
    Socks5,
}

impl ProxyProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyProtocol::Http => "http",
            ProxyProtocol::Https => "https",
            ProxyProtocol::Socks5 => "socks5",
        }
    }
}

/// Proxy record as found in the external configuration list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyRecord {
    pub id: String,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub protocol: ProxyProtocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Clone, PartialEq, Eq)]
pub struct ProxyCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ProxyCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyCredentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// An egress path handed out to a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proxy {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub protocol: ProxyProtocol,
    pub credentials: Option<ProxyCredentials>,
}

impl Proxy {
    /// `scheme://host:port`, without credentials.
    pub fn server(&self) -> String {
        format!("{}://{}:{}", self.protocol.as_str(), self.host, self.port)
    }
}

impl From<ProxyRecord> for Proxy {
    fn from(record: ProxyRecord) -> Self {
        let credentials = match (record.username, record.password) {
            (Some(username), password) => Some(ProxyCredentials {
                username,
                password: password.unwrap_or_default(),
            }),
            (None, _) => None,
        };
        Self {
            id: record.id,
            host: record.host,
            port: record.port,
            protocol: record.protocol,
            credentials,
        }
    }
}

/// How the cursor moves between calls to [`ProxyManager::next`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RotationStrategy {
    /// Reuse the current proxy until it fails, the rotation interval
    /// elapses, or the per-proxy request budget is spent.
    #[default]
    Sticky,
    /// Advance on every call.
    Sequential,
}

/// Configuration for proxy rotation and quarantine.
#[derive(Debug, Clone)]
pub struct ProxyPoolConfig {
    pub strategy: RotationStrategy,

    /// How long a failing proxy stays out of rotation.
    pub quarantine_window: Duration,

    /// Advance the cursor at least this often, even without failures.
    pub rotation_interval: Duration,

    /// Advance after this many consecutive selections of one proxy (0 = off).
    pub max_requests_per_rotation: u32,

    /// Fail with `ResourceExhausted` instead of running proxy-less.
    pub required: bool,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            strategy: RotationStrategy::Sticky,
            quarantine_window: Duration::from_secs(120),
            rotation_interval: Duration::from_secs(300),
            max_requests_per_rotation: 20,
            required: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ProxyEntry {
    proxy: Proxy,
    success_count: u64,
    failure_count: u64,
    avg_latency_ms: f64,
    quarantined_until: Option<Instant>,
    last_used_at: Option<Instant>,
}

impl ProxyEntry {
    fn new(proxy: Proxy) -> Self {
        Self {
            proxy,
            success_count: 0,
            failure_count: 0,
            avg_latency_ms: 0.0,
            quarantined_until: None,
            last_used_at: None,
        }
    }

    fn is_quarantined(&self, now: Instant) -> bool {
        self.quarantined_until.is_some_and(|until| until > now)
    }
}

#[derive(Debug)]
struct ProxyManagerInner {
    entries: Vec<ProxyEntry>,
    cursor: usize,
    last_rotation: Instant,
    uses_since_rotation: u32,
}

/// Per-proxy figures for reporting.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProxyStatus {
    pub id: String,
    pub server: String,
    pub success_count: u64,
    pub failure_count: u64,
    pub avg_latency_ms: f64,
    pub quarantined: bool,
    pub quarantine_remaining_ms: Option<u64>,
    pub last_used_ms_ago: Option<u64>,
}

/// Aggregate proxy statistics.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProxyStats {
    pub total: usize,
    pub available: usize,
    pub quarantined: usize,
    pub proxies: Vec<ProxyStatus>,
}

/// Thread-safe proxy manager; all state sits behind one mutex.
#[derive(Debug)]
pub struct ProxyManager {
    config: ProxyPoolConfig,
    inner: Mutex<ProxyManagerInner>,
}

impl ProxyManager {
    pub fn new(config: ProxyPoolConfig, proxies: impl IntoIterator<Item = Proxy>) -> Self {
        let mut entries: Vec<ProxyEntry> = Vec::new();
        for proxy in proxies {
            if entries.iter().any(|e| e.proxy.id == proxy.id) {
                tracing::warn!(proxy_id = %proxy.id, "Duplicate proxy id ignored");
                continue;
            }
            entries.push(ProxyEntry::new(proxy));
        }

        Self {
            config,
            inner: Mutex::new(ProxyManagerInner {
                entries,
                cursor: 0,
                last_rotation: Instant::now(),
                uses_since_rotation: 0,
            }),
        }
    }

    pub fn from_records(config: ProxyPoolConfig, records: Vec<ProxyRecord>) -> Self {
        Self::new(config, records.into_iter().map(Proxy::from))
    }

    /// A manager with no proxies; every `next()` returns `None`.
    pub fn empty() -> Self {
        Self::new(ProxyPoolConfig::default(), Vec::new())
    }

    pub fn config(&self) -> &ProxyPoolConfig {
        &self.config
    }

    fn lock_inner(&self) -> MutexGuard<'_, ProxyManagerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned proxy manager mutex");
            poisoned.into_inner()
        })
    }

    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Selects the next healthy proxy.
    ///
    /// Returns `None` when the list is empty or a full cycle finds every
    /// proxy quarantined; the caller then decides whether to run without one.
    pub fn next(&self) -> Option<Proxy> {
        let now = Instant::now();
        let mut inner = self.lock_inner();
        let len = inner.entries.len();
        if len == 0 {
            return None;
        }

        let rotate = match self.config.strategy {
            RotationStrategy::Sequential => inner.entries[inner.cursor].last_used_at.is_some(),
            RotationStrategy::Sticky => {
                let interval_elapsed =
                    now.duration_since(inner.last_rotation) > self.config.rotation_interval;
                let budget_spent = self.config.max_requests_per_rotation > 0
                    && inner.uses_since_rotation >= self.config.max_requests_per_rotation;
                interval_elapsed || budget_spent
            }
        };
        if rotate {
            inner.cursor = (inner.cursor + 1) % len;
            inner.last_rotation = now;
            inner.uses_since_rotation = 0;
            tracing::debug!(cursor = inner.cursor, "Proxy rotation advanced");
        }

        let start = inner.cursor;
        let selected = (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| !inner.entries[idx].is_quarantined(now));

        let Some(idx) = selected else {
            tracing::warn!(total = len, "All proxies quarantined, proceeding without proxy");
            return None;
        };

        if idx != inner.cursor {
            inner.cursor = idx;
            inner.last_rotation = now;
            inner.uses_since_rotation = 0;
        }
        inner.uses_since_rotation += 1;

        let entry = &mut inner.entries[idx];
        // Quarantine that has lapsed is cleared lazily here.
        entry.quarantined_until = None;
        entry.last_used_at = Some(now);
        Some(entry.proxy.clone())
    }

    /// Records a successful request through `id`, clearing any quarantine.
    pub fn record_success(&self, id: &str, latency: Duration) {
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.proxy.id == id) {
            entry.success_count += 1;
            let latency_ms = latency.as_secs_f64() * 1000.0;
            entry.avg_latency_ms +=
                (latency_ms - entry.avg_latency_ms) / entry.success_count as f64;
            if entry.quarantined_until.take().is_some() {
                tracing::info!(proxy_id = %id, "Proxy released from quarantine after success");
            }
        }
    }

    /// Records a failed request through `id` and quarantines it.
    pub fn record_failure(&self, id: &str) {
        let now = Instant::now();
        let window = self.config.quarantine_window;
        let mut inner = self.lock_inner();
        if let Some(entry) = inner.entries.iter_mut().find(|e| e.proxy.id == id) {
            entry.failure_count += 1;
            entry.quarantined_until = Some(util::instant_after(now, window));
            tracing::warn!(
                proxy_id = %id,
                failures = entry.failure_count,
                quarantine_secs = window.as_secs(),
                "Proxy quarantined"
            );
        }
    }

    /// Whether `id` is currently out of rotation.
    pub fn is_quarantined(&self, id: &str) -> bool {
        let now = Instant::now();
        self.lock_inner()
            .entries
            .iter()
            .find(|e| e.proxy.id == id)
            .is_some_and(|e| e.is_quarantined(now))
    }

    pub fn stats(&self) -> ProxyStats {
        let now = Instant::now();
        let inner = self.lock_inner();
        let proxies: Vec<ProxyStatus> = inner
            .entries
            .iter()
            .map(|e| ProxyStatus {
                id: e.proxy.id.clone(),
                server: e.proxy.server(),
                success_count: e.success_count,
                failure_count: e.failure_count,
                avg_latency_ms: e.avg_latency_ms,
                quarantined: e.is_quarantined(now),
                quarantine_remaining_ms: e
                    .quarantined_until
                    .and_then(|until| until.checked_duration_since(now))
                    .filter(|d| !d.is_zero())
                    .map(|d| d.as_millis() as u64),
                last_used_ms_ago: e
                    .last_used_at
                    .map(|t| now.duration_since(t).as_millis() as u64),
            })
            .collect();
        let quarantined = proxies.iter().filter(|p| p.quarantined).count();

        ProxyStats {
            total: proxies.len(),
            available: proxies.len() - quarantined,
            quarantined,
            proxies,
        }
    }
}
