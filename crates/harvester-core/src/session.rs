//! Browsing identity persistence for warm restarts.
//!
//! The snapshot file is a small JSON document:
//!
//! ```json
//! {"cookies": [...], "timestamp": 1700000000000, "userAgent": "...", "url": "..."}
//! ```
//!
//! `timestamp` is the session creation time in milliseconds since the epoch.
//! Writes go to a sibling temp file first and are renamed into place.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::Cookie;
use crate::util;

/// User agents a fresh session picks from.
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
];

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session snapshot I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Session snapshot is not valid JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Configuration for the session store.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Snapshot file location.
    pub path: PathBuf,

    /// Sessions older than this are discarded on load.
    pub timeout: Duration,

    /// Fraction of `timeout` after which a session should be refreshed.
    pub refresh_fraction: f64,
}

impl Default for SessionConfig {
    /// `.harvester/session.json`, one hour, refresh at 80%.
    fn default() -> Self {
        Self {
            path: PathBuf::from(".harvester/session.json"),
            timeout: Duration::from_secs(3600),
            refresh_fraction: 0.8,
        }
    }
}

/// On-disk representation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionSnapshot {
    #[serde(default)]
    id: Option<Uuid>,
    cookies: Vec<Cookie>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    timestamp: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    last_activity: Option<DateTime<Utc>>,
    user_agent: String,
    #[serde(default)]
    url: Option<String>,
}

/// One browsing identity: cookies plus the user agent they belong to.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: Uuid,
    /// Insertion-ordered; at most one record per (name, domain, path).
    pub cookies: Vec<Cookie>,
    pub user_agent: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// A fresh identity with a randomly chosen user agent and no cookies.
    pub fn fresh(timeout: Duration) -> Self {
        let user_agent = util::pick(USER_AGENTS)
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        Self::with_user_agent(user_agent, timeout)
    }

    pub fn with_user_agent(user_agent: impl Into<String>, timeout: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            cookies: Vec::new(),
            user_agent: user_agent.into(),
            url: None,
            created_at: now,
            last_activity_at: now,
            expires_at: now + to_time_delta(timeout),
        }
    }

    pub fn age(&self) -> Duration {
        (Utc::now() - self.created_at).to_std().unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Upserts cookies, keeping first-seen order.
    pub fn merge_cookies(&mut self, cookies: impl IntoIterator<Item = Cookie>) {
        for cookie in cookies {
            match self.cookies.iter_mut().find(|c| c.same_identity(&cookie)) {
                Some(existing) => *existing = cookie,
                None => self.cookies.push(cookie),
            }
        }
    }

    pub fn touch(&mut self, url: Option<&str>) {
        self.last_activity_at = Utc::now();
        if let Some(url) = url {
            self.url = Some(url.to_string());
        }
    }

    fn from_snapshot(snapshot: SessionSnapshot, timeout: Duration) -> Self {
        Self {
            id: snapshot.id.unwrap_or_else(Uuid::new_v4),
            cookies: snapshot.cookies,
            user_agent: snapshot.user_agent,
            url: snapshot.url,
            created_at: snapshot.timestamp,
            last_activity_at: snapshot.last_activity.unwrap_or(snapshot.timestamp),
            expires_at: snapshot.timestamp + to_time_delta(timeout),
        }
    }

    fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            id: Some(self.id),
            cookies: self.cookies.clone(),
            timestamp: self.created_at,
            last_activity: Some(self.last_activity_at),
            user_agent: self.user_agent.clone(),
            url: self.url.clone(),
        }
    }
}

/// File-backed session store. Performs no network activity.
#[derive(Debug, Clone)]
pub struct SessionStore {
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }

    /// Loads the persisted session.
    ///
    /// Returns `Ok(None)` when no snapshot exists. A snapshot older than the
    /// session timeout, or one that cannot be parsed, is deleted and also
    /// yields `Ok(None)`.
    pub fn load(&self) -> Result<Option<Session>, SessionError> {
        let raw = match std::fs::read_to_string(&self.config.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let snapshot: SessionSnapshot = match serde_json::from_str(&raw) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::warn!(path = %self.config.path.display(), error = %e, "Discarding unreadable session snapshot");
                self.clear()?;
                return Ok(None);
            }
        };

        let session = Session::from_snapshot(snapshot, self.config.timeout);
        if session.age() > self.config.timeout {
            tracing::info!(
                session_id = %session.id,
                age_secs = session.age().as_secs(),
                "Session snapshot expired, clearing"
            );
            self.clear()?;
            return Ok(None);
        }

        tracing::debug!(session_id = %session.id, cookies = session.cookies.len(), "Loaded session snapshot");
        Ok(Some(session))
    }

    /// Persists `session`, replacing any previous snapshot.
    pub fn save(&self, session: &Session) -> Result<(), SessionError> {
        let path = &self.config.path;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_vec_pretty(&session.to_snapshot())?;
        let tmp = temp_path(path);
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, path)?;

        tracing::debug!(session_id = %session.id, path = %path.display(), "Saved session snapshot");
        Ok(())
    }

    /// True once the session has lived past the refresh fraction of the timeout.
    pub fn needs_refresh(&self, session: &Session) -> bool {
        let threshold = self.config.timeout.mul_f64(self.config.refresh_fraction);
        session.age() > threshold
    }

    /// Deletes the snapshot; a missing file is not an error.
    pub fn clear(&self) -> Result<(), SessionError> {
        match std::fs::remove_file(&self.config.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "session.json".into());
    name.push(".tmp");
    path.with_file_name(name)
}

fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or_else(|_| TimeDelta::weeks(52 * 100))
}
