use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use url::Url;
use uuid::Uuid;

use crate::error::{AppError, ErrorKind};
use crate::proxy::Proxy;

/// Normalized identity of what is being extracted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetKey {
    /// Canonical URL (fragment stripped).
    pub url: String,
    /// Optional secondary identity (e.g. a listing id on the same page).
    pub auxiliary: Option<String>,
    /// SHA-256 of `url` + `auxiliary`, used as the cache key.
    pub cache_key: String,
}

impl TargetKey {
    /// Parse and normalize a target identity.
    ///
    /// Only absolute `http`/`https` URLs with a host are accepted.
    pub fn parse(target: &str, auxiliary: Option<&str>) -> Result<Self, AppError> {
        let trimmed = target.trim();
        if trimmed.is_empty() {
            return Err(AppError::ValidationError("target is empty".into()));
        }

        let mut url = Url::parse(trimmed)
            .map_err(|e| AppError::ValidationError(format!("invalid target '{trimmed}': {e}")))?;

        match url.scheme() {
            "http" | "https" => {}
            scheme => {
                return Err(AppError::ValidationError(format!(
                    "URL scheme '{scheme}' is not allowed (only http/https)"
                )));
            }
        }
        if url.host_str().is_none_or(str::is_empty) {
            return Err(AppError::ValidationError(format!(
                "target '{trimmed}' has no host"
            )));
        }
        url.set_fragment(None);

        let auxiliary = auxiliary
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string);

        let url = url.to_string();
        let cache_key = match &auxiliary {
            Some(aux) => compute_hash(&format!("{url}\n{aux}")),
            None => compute_hash(&url),
        };

        Ok(Self {
            url,
            auxiliary,
            cache_key,
        })
    }

    /// Host portion of the URL, used for per-host pacing.
    pub fn host(&self) -> Option<String> {
        Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
    }
}

/// Compute a SHA-256 hash of a string, returned as 64-char hex.
pub fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A single cookie record as persisted in the session snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Expiry as seconds since the Unix epoch; `None` for session cookies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<f64>,
    #[serde(default)]
    pub http_only: bool,
    #[serde(default)]
    pub secure: bool,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            http_only: false,
            secure: false,
        }
    }

    /// Two records denote the same cookie when name, domain and path match.
    pub fn same_identity(&self, other: &Cookie) -> bool {
        self.name == other.name && self.domain == other.domain && self.path == other.path
    }
}

/// What the execution context is asked to do for one attempt.
#[derive(Debug, Clone)]
pub struct NavigationRequest {
    pub url: String,
    pub proxy: Option<Proxy>,
    pub user_agent: Option<String>,
    pub cookies: Vec<Cookie>,
    /// Page-load budget handed to the engine.
    pub timeout: Duration,
}

impl NavigationRequest {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            proxy: None,
            user_agent: None,
            cookies: Vec::new(),
            timeout,
        }
    }
}

/// Raw outcome of a navigation, before classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageSnapshot {
    /// HTTP status when the engine can observe it.
    pub status: Option<u16>,
    /// URL after redirects.
    pub final_url: String,
    /// Text or markup of the rendered page.
    pub content: String,
    /// Cookies set by the target during this navigation.
    pub cookies: Vec<Cookie>,
}

impl PageSnapshot {
    pub fn new(final_url: impl Into<String>, status: Option<u16>, content: impl Into<String>) -> Self {
        Self {
            status,
            final_url: final_url.into(),
            content: content.into(),
            cookies: Vec::new(),
        }
    }
}

/// Per-request unit of work tracked by the orchestrator.
#[derive(Debug, Clone)]
pub struct ExtractionTask {
    pub id: Uuid,
    pub key: TargetKey,
    pub attempt: u32,
    pub started_at: Instant,
    pub deadline: Instant,
    pub proxy: Option<Proxy>,
}

impl ExtractionTask {
    pub fn new(key: TargetKey, deadline: Instant) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            attempt: 0,
            started_at: Instant::now(),
            deadline,
            proxy: None,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Time left before the task deadline, or `None` once it has passed.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .checked_duration_since(Instant::now())
            .filter(|d| !d.is_zero())
    }
}

/// Terminal outcome of an extraction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Success {
        payload: serde_json::Value,
    },
    Failure {
        kind: ErrorKind,
        message: String,
    },
}

/// Result handed back to the caller of [`Orchestrator::extract`](crate::orchestrator::Orchestrator::extract).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub target: String,
    #[serde(flatten)]
    pub outcome: Outcome,
    pub timing_ms: u64,
    pub served_from_cache: bool,
    pub attempts: u32,
}

impl ExtractionResult {
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Outcome::Success { .. })
    }

    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            Outcome::Success { payload } => Some(payload),
            Outcome::Failure { .. } => None,
        }
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        match &self.outcome {
            Outcome::Success { .. } => None,
            Outcome::Failure { kind, .. } => Some(*kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compute_hash_consistency() {
        let h1 = compute_hash("hello world");
        let h2 = compute_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_target_key_strips_fragment() {
        let a = TargetKey::parse("https://Example.com/a#section", None).unwrap();
        let b = TargetKey::parse("https://example.com/a", None).unwrap();
        assert_eq!(a.url, "https://example.com/a");
        assert_eq!(a.cache_key, b.cache_key);
    }

    #[test]
    fn test_target_key_auxiliary_changes_cache_key() {
        let a = TargetKey::parse("https://example.com/a", Some("listing-1")).unwrap();
        let b = TargetKey::parse("https://example.com/a", Some("listing-2")).unwrap();
        let c = TargetKey::parse("https://example.com/a", Some("   ")).unwrap();
        assert_ne!(a.cache_key, b.cache_key);
        assert_eq!(c.auxiliary, None);
    }

    #[test]
    fn test_target_key_rejects_bad_input() {
        for bad in ["", "not a url", "ftp://example.com/file", "file:///etc/passwd"] {
            let err = TargetKey::parse(bad, None).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "input {bad:?}");
        }
    }

    #[test]
    fn test_target_key_host() {
        let key = TargetKey::parse("http://shop.example.com:8080/item?id=3", None).unwrap();
        assert_eq!(key.host().as_deref(), Some("shop.example.com"));
    }

    #[test]
    fn test_cookie_identity() {
        let mut a = Cookie::new("sid", "1");
        let b = Cookie::new("sid", "2");
        assert!(a.same_identity(&b));
        a.domain = Some("example.com".into());
        assert!(!a.same_identity(&b));
    }

    #[test]
    fn test_result_serializes_flat() {
        let result = ExtractionResult {
            target: "https://example.com/".into(),
            outcome: Outcome::Failure {
                kind: ErrorKind::BlockDetected,
                message: "captcha".into(),
            },
            timing_ms: 12,
            served_from_cache: false,
            attempts: 3,
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["status"], "failure");
        assert_eq!(json["kind"], "block_detected");
        assert_eq!(json["attempts"], 3);
    }
}
