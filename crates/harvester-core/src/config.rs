//! Runtime configuration.
//!
//! Every knob has a default and can be overridden through a `HARVESTER_*`
//! environment variable. [`HarvesterConfig::from_lookup`] takes the lookup
//! as a function so callers other than the binary never touch the process
//! environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::anti_block::AntiBlockConfig;
use crate::cache::CacheConfig;
use crate::pacing::PacingConfig;
use crate::pool::PoolConfig;
use crate::proxy::{ProxyPoolConfig, ProxyRecord};
use crate::retry::RetryPolicy;
use crate::session::SessionConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid {var} '{value}': {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    Constraint(String),

    #[error("Failed to read proxy file {path}: {source}")]
    ProxyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid proxy file {path}: {source}")]
    ProxyJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Upper bound for every configured duration. Anything longer is a typo
/// and would overflow the monotonic clock when added to "now".
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

/// Deadlines for one extraction.
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    /// Page-load budget handed to the engine.
    pub navigation: Duration,

    /// Upper bound for one whole attempt (navigation plus extraction).
    pub extraction: Duration,

    /// Overall deadline for a task, covering all waits and attempts.
    pub total: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            navigation: Duration::from_secs(30),
            extraction: Duration::from_secs(45),
            total: Duration::from_secs(180),
        }
    }
}

/// Complete configuration for an orchestrator instance.
#[derive(Debug, Clone)]
pub struct HarvesterConfig {
    pub pacing: PacingConfig,
    pub session: SessionConfig,
    pub anti_block: AntiBlockConfig,
    pub retry: RetryPolicy,
    pub timeouts: TimeoutConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub proxy: ProxyPoolConfig,
    /// Serialize concurrent extractions of the same key.
    pub coalesce_in_flight: bool,
    /// JSON proxy list to load at startup.
    pub proxy_file: Option<PathBuf>,
}

impl Default for HarvesterConfig {
    fn default() -> Self {
        Self {
            pacing: PacingConfig::default(),
            session: SessionConfig::default(),
            anti_block: AntiBlockConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: TimeoutConfig::default(),
            pool: PoolConfig::default(),
            cache: CacheConfig::default(),
            proxy: ProxyPoolConfig::default(),
            coalesce_in_flight: true,
            proxy_file: None,
        }
    }
}

impl HarvesterConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read configuration through `lookup`, falling back to defaults for
    /// unset variables. The result is validated.
    pub fn from_lookup<L>(lookup: L) -> Result<Self, ConfigError>
    where
        L: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);
        let defaults = Self::default();

        let jitter = env.millis("HARVESTER_JITTER_MS", defaults.pacing.jitter)?;

        let pacing = PacingConfig {
            min_delay: env.millis("HARVESTER_MIN_DELAY_MS", defaults.pacing.min_delay)?,
            max_delay: env.millis("HARVESTER_MAX_DELAY_MS", defaults.pacing.max_delay)?,
            jitter,
            burst_threshold: env.number(
                "HARVESTER_BURST_THRESHOLD",
                defaults.pacing.burst_threshold as u64,
            )? as usize,
            burst_window: env.secs("HARVESTER_BURST_WINDOW_SECS", defaults.pacing.burst_window)?,
            burst_delay: env.millis("HARVESTER_BURST_DELAY_MS", defaults.pacing.burst_delay)?,
        };

        let session = SessionConfig {
            path: env
                .string("HARVESTER_SESSION_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.session.path),
            timeout: env.secs("HARVESTER_SESSION_DURATION_SECS", defaults.session.timeout)?,
            refresh_fraction: env.float(
                "HARVESTER_SESSION_REFRESH_FRACTION",
                defaults.session.refresh_fraction,
            )?,
        };

        let anti_block = AntiBlockConfig {
            initial_cooldown: env.millis(
                "HARVESTER_COOLDOWN_MIN_MS",
                defaults.anti_block.initial_cooldown,
            )?,
            max_cooldown: env.millis("HARVESTER_COOLDOWN_MAX_MS", defaults.anti_block.max_cooldown)?,
            backoff_multiplier: env.float(
                "HARVESTER_BACKOFF_MULTIPLIER",
                defaults.anti_block.backoff_multiplier,
            )?,
            reset_after_successes: env.number(
                "HARVESTER_COOLDOWN_RESET_AFTER",
                defaults.anti_block.reset_after_successes as u64,
            )? as u32,
            ..defaults.anti_block
        };

        let retry = RetryPolicy {
            max_attempts: env.number(
                "HARVESTER_RETRY_MAX_ATTEMPTS",
                defaults.retry.max_attempts as u64,
            )? as u32,
            base_delay: env.millis("HARVESTER_RETRY_BASE_DELAY_MS", defaults.retry.base_delay)?,
            multiplier: env.float("HARVESTER_RETRY_MULTIPLIER", defaults.retry.multiplier)?,
            max_jitter: jitter,
            max_extraction_retries: env.number(
                "HARVESTER_RETRY_MAX_EXTRACTION",
                defaults.retry.max_extraction_retries as u64,
            )? as u32,
        };

        let timeouts = TimeoutConfig {
            navigation: env.millis(
                "HARVESTER_NAVIGATION_TIMEOUT_MS",
                defaults.timeouts.navigation,
            )?,
            extraction: env.millis(
                "HARVESTER_EXTRACTION_TIMEOUT_MS",
                defaults.timeouts.extraction,
            )?,
            total: env.millis("HARVESTER_TOTAL_TIMEOUT_MS", defaults.timeouts.total)?,
        };

        let proxy = ProxyPoolConfig {
            rotation_interval: env.secs(
                "HARVESTER_PROXY_ROTATION_SECS",
                defaults.proxy.rotation_interval,
            )?,
            quarantine_window: env.secs(
                "HARVESTER_PROXY_QUARANTINE_SECS",
                defaults.proxy.quarantine_window,
            )?,
            max_requests_per_rotation: env.number(
                "HARVESTER_MAX_REQUESTS_PER_ROTATION",
                defaults.proxy.max_requests_per_rotation as u64,
            )? as u32,
            required: env.flag("HARVESTER_PROXY_REQUIRED", defaults.proxy.required)?,
            ..defaults.proxy
        };

        let config = Self {
            pacing,
            session,
            anti_block,
            retry,
            timeouts,
            pool: PoolConfig {
                capacity: env.number("HARVESTER_POOL_CAPACITY", defaults.pool.capacity as u64)?
                    as usize,
            },
            cache: CacheConfig {
                default_ttl: env.secs("HARVESTER_CACHE_TTL_SECS", defaults.cache.default_ttl)?,
                max_entries: env.number(
                    "HARVESTER_CACHE_MAX_ENTRIES",
                    defaults.cache.max_entries as u64,
                )? as usize,
            },
            proxy,
            coalesce_in_flight: env.flag("HARVESTER_COALESCE", defaults.coalesce_in_flight)?,
            proxy_file: env.string("HARVESTER_PROXY_FILE").map(PathBuf::from),
        };

        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Constraint(msg.to_string()));

        if self.pool.capacity == 0 {
            return fail("pool capacity must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return fail("retry max attempts must be at least 1");
        }
        if self.pacing.min_delay > self.pacing.max_delay {
            return fail("min delay must not exceed max delay");
        }
        if self.anti_block.initial_cooldown > self.anti_block.max_cooldown {
            return fail("min cooldown must not exceed max cooldown");
        }
        if self.anti_block.backoff_multiplier < 1.0 || !self.anti_block.backoff_multiplier.is_finite()
        {
            return fail("backoff multiplier must be at least 1");
        }
        if self.retry.multiplier < 1.0 || !self.retry.multiplier.is_finite() {
            return fail("retry multiplier must be at least 1");
        }
        let fraction = self.session.refresh_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return fail("session refresh fraction must be in (0, 1]");
        }
        if self.timeouts.total.is_zero() || self.timeouts.navigation.is_zero() {
            return fail("timeouts must be non-zero");
        }

        let durations = [
            ("min delay", self.pacing.min_delay),
            ("max delay", self.pacing.max_delay),
            ("jitter", self.pacing.jitter),
            ("burst window", self.pacing.burst_window),
            ("burst delay", self.pacing.burst_delay),
            ("session duration", self.session.timeout),
            ("min cooldown", self.anti_block.initial_cooldown),
            ("max cooldown", self.anti_block.max_cooldown),
            ("retry base delay", self.retry.base_delay),
            ("retry jitter", self.retry.max_jitter),
            ("navigation timeout", self.timeouts.navigation),
            ("extraction timeout", self.timeouts.extraction),
            ("total timeout", self.timeouts.total),
            ("cache TTL", self.cache.default_ttl),
            ("proxy rotation interval", self.proxy.rotation_interval),
            ("proxy quarantine window", self.proxy.quarantine_window),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, d)| *d > MAX_DURATION) {
            return Err(ConfigError::Constraint(format!(
                "{name} must not exceed one year"
            )));
        }
        Ok(())
    }

    /// Checks constraints that depend on the loaded proxy list.
    pub fn validate_proxies(&self, proxy_count: usize) -> Result<(), ConfigError> {
        if self.proxy.required && proxy_count == 0 {
            return Err(ConfigError::Constraint(
                "a proxy is required but the proxy list is empty".into(),
            ));
        }
        Ok(())
    }
}

/// Load a JSON array of proxy records.
pub fn load_proxy_records(path: &Path) -> Result<Vec<ProxyRecord>, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::ProxyFile {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::ProxyJson {
        path: path.to_path_buf(),
        source,
    })
}

struct Env<'a, L>(&'a L);

impl<L> Env<'_, L>
where
    L: Fn(&str) -> Option<String>,
{
    fn string(&self, var: &'static str) -> Option<String> {
        (self.0)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn number(&self, var: &'static str, default: u64) -> Result<u64, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue {
                var,
                value: raw,
                reason: "must be a non-negative integer",
            }),
        }
    }

    fn float(&self, var: &'static str, default: f64) -> Result<f64, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => match raw.parse::<f64>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(ConfigError::InvalidValue {
                    var,
                    value: raw,
                    reason: "must be a finite number",
                }),
            },
        }
    }

    fn flag(&self, var: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.string(var) {
            None => Ok(default),
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    var,
                    value: raw,
                    reason: "must be true or false",
                }),
            },
        }
    }

    fn millis(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.number(var, default.as_millis() as u64)
            .map(Duration::from_millis)
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.number(var, default.as_secs()).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = HarvesterConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.pacing.min_delay, Duration::from_millis(1000));
        assert_eq!(config.pacing.max_delay, Duration::from_millis(3000));
        assert_eq!(config.anti_block.initial_cooldown, Duration::from_secs(5));
        assert_eq!(config.anti_block.max_cooldown, Duration::from_secs(300));
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.timeouts.total, Duration::from_secs(180));
        assert_eq!(config.pool.capacity, 2);
        assert_eq!(config.cache.max_entries, 500);
        assert_eq!(config.proxy.max_requests_per_rotation, 20);
        assert!(config.coalesce_in_flight);
        assert!(config.proxy_file.is_none());
    }

    #[test]
    fn overrides_are_applied() {
        let config = HarvesterConfig::from_lookup(lookup(&[
            ("HARVESTER_POOL_CAPACITY", "4"),
            ("HARVESTER_COOLDOWN_MIN_MS", "250"),
            ("HARVESTER_BACKOFF_MULTIPLIER", "1.5"),
            ("HARVESTER_PROXY_REQUIRED", "yes"),
            ("HARVESTER_SESSION_FILE", "/tmp/s.json"),
            ("HARVESTER_JITTER_MS", "0"),
            ("HARVESTER_COALESCE", "off"),
        ]))
        .unwrap();
        assert_eq!(config.pool.capacity, 4);
        assert_eq!(config.anti_block.initial_cooldown, Duration::from_millis(250));
        assert_eq!(config.anti_block.backoff_multiplier, 1.5);
        assert!(config.proxy.required);
        assert_eq!(config.session.path, PathBuf::from("/tmp/s.json"));
        assert_eq!(config.retry.max_jitter, Duration::ZERO);
        assert!(!config.coalesce_in_flight);
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = HarvesterConfig::from_lookup(lookup(&[("HARVESTER_POOL_CAPACITY", "two")]))
            .unwrap_err();
        assert!(err.to_string().contains("HARVESTER_POOL_CAPACITY"));
    }

    #[test]
    fn constraints_are_enforced() {
        let cases: [&[(&str, &str)]; 6] = [
            &[("HARVESTER_POOL_CAPACITY", "0")],
            &[("HARVESTER_RETRY_MAX_ATTEMPTS", "0")],
            &[("HARVESTER_MIN_DELAY_MS", "5000")],
            &[("HARVESTER_COOLDOWN_MAX_MS", "10")],
            &[("HARVESTER_BACKOFF_MULTIPLIER", "0.5")],
            &[("HARVESTER_SESSION_REFRESH_FRACTION", "1.5")],
        ];
        for pairs in cases {
            let result = HarvesterConfig::from_lookup(lookup(pairs));
            assert!(
                matches!(result, Err(ConfigError::Constraint(_))),
                "{pairs:?} should be rejected"
            );
        }
    }

    #[test]
    fn durations_past_one_year_are_rejected() {
        let cases: [&[(&str, &str)]; 4] = [
            &[("HARVESTER_CACHE_TTL_SECS", "18446744073709551615")],
            &[("HARVESTER_PROXY_QUARANTINE_SECS", "40000000")],
            &[("HARVESTER_BURST_DELAY_MS", "18446744073709551615")],
            &[("HARVESTER_TOTAL_TIMEOUT_MS", "99999999999")],
        ];
        for pairs in cases {
            let err = HarvesterConfig::from_lookup(lookup(pairs)).unwrap_err();
            assert!(
                err.to_string().contains("must not exceed one year"),
                "{pairs:?}: {err}"
            );
        }

        let limit = MAX_DURATION.as_secs().to_string();
        let at_limit = HarvesterConfig::from_lookup(lookup(&[(
            "HARVESTER_CACHE_TTL_SECS",
            limit.as_str(),
        )]));
        assert!(at_limit.is_ok());
    }

    #[test]
    fn required_proxy_needs_a_list() {
        let mut config = HarvesterConfig::default();
        config.proxy.required = true;
        assert!(config.validate_proxies(0).is_err());
        assert!(config.validate_proxies(1).is_ok());
    }

    #[test]
    fn proxy_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxies.json");
        std::fs::write(
            &path,
            r#"[{"id": "p1", "host": "10.0.0.1", "port": 8080},
                {"id": "p2", "host": "10.0.0.2", "port": 1080, "protocol": "socks5",
                 "username": "u", "password": "p"}]"#,
        )
        .unwrap();

        let records = load_proxy_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].username.as_deref(), Some("u"));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_proxy_records(&path),
            Err(ConfigError::ProxyJson { .. })
        ));
        assert!(matches!(
            load_proxy_records(&dir.path().join("missing.json")),
            Err(ConfigError::ProxyFile { .. })
        ));
    }
}
