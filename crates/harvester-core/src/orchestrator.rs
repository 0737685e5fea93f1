//! Per-request extraction state machine.
//!
//! ```text
//! Queued -> CacheCheck --hit--> Completed
//!               |
//!              miss
//!               v
//!           Acquiring (proxy, cooldown, pacing, session, pool slot)
//!               v
//!           Executing (navigate under the attempt budget)
//!               v
//!           Classifying --blocked--> record block, drop session --+
//!               |                                                |
//!               +--denial status--> ExtractionError -------------+
//!               |                                                |
//!             clear/suspicious                                   |
//!               v                                                v
//!           extract fields --ok--> cache, proxy success --> Completed
//!               |                                                ^
//!             error --retryable + attempts left--> Retrying -----+--> Acquiring
//!               |
//!               +--> Failed
//! ```
//!
//! The pooled context is released as soon as navigation returns, on every
//! path. Callers only ever see the terminal [`ExtractionResult`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use uuid::Uuid;

use crate::anti_block::{AntiBlockDetector, AntiBlockReport, BlockSignal, Verdict};
use crate::cache::{CacheStats, ResultCache};
use crate::config::HarvesterConfig;
use crate::error::{AppError, ErrorKind};
use crate::models::{
    ExtractionResult, ExtractionTask, NavigationRequest, Outcome, PageSnapshot, TargetKey,
};
use crate::pacing::Pacer;
use crate::pool::{ExecutionPool, PoolStats};
use crate::proxy::{Proxy, ProxyManager, ProxyStats};
use crate::retry::{RetryController, RetryDecision};
use crate::session::{Session, SessionStore};
use crate::traits::{ContextFactory, ExecutionContext, FieldExtractor};
use crate::util;

/// Events emitted by the orchestrator for monitoring/logging.
#[derive(Debug, Clone)]
pub enum ExtractionEvent<'a> {
    Received {
        task_id: Uuid,
        target: &'a str,
    },
    CacheHit {
        task_id: Uuid,
        target: &'a str,
    },
    CacheMiss {
        task_id: Uuid,
    },
    /// Another task is already extracting the same key.
    Coalesced {
        task_id: Uuid,
    },
    AttemptStarted {
        task_id: Uuid,
        attempt: u32,
        proxy_id: Option<&'a str>,
    },
    CoolingDown {
        task_id: Uuid,
        remaining: Duration,
    },
    Classified {
        task_id: Uuid,
        verdict: Verdict,
        detail: &'a str,
    },
    SessionRefreshed {
        session_id: Uuid,
        reason: &'a str,
    },
    Retrying {
        task_id: Uuid,
        attempt: u32,
        delay: Duration,
        error: &'a AppError,
    },
    Completed {
        task_id: Uuid,
        attempts: u32,
        timing_ms: u64,
    },
    Failed {
        task_id: Uuid,
        attempts: u32,
        error: &'a AppError,
    },
}

impl ExtractionEvent<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            ExtractionEvent::Received { .. } => "received",
            ExtractionEvent::CacheHit { .. } => "cache_hit",
            ExtractionEvent::CacheMiss { .. } => "cache_miss",
            ExtractionEvent::Coalesced { .. } => "coalesced",
            ExtractionEvent::AttemptStarted { .. } => "attempt_started",
            ExtractionEvent::CoolingDown { .. } => "cooling_down",
            ExtractionEvent::Classified { .. } => "classified",
            ExtractionEvent::SessionRefreshed { .. } => "session_refreshed",
            ExtractionEvent::Retrying { .. } => "retrying",
            ExtractionEvent::Completed { .. } => "completed",
            ExtractionEvent::Failed { .. } => "failed",
        }
    }
}

/// Trait for receiving orchestrator events (decoupled logging).
pub trait ExtractionReporter: Send + Sync {
    fn report(&self, event: ExtractionEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ExtractionReporter for TracingReporter {
    fn report(&self, event: ExtractionEvent<'_>) {
        match event {
            ExtractionEvent::Received { task_id, target } => {
                tracing::debug!(%task_id, %target, "Extraction received");
            }
            ExtractionEvent::CacheHit { task_id, target } => {
                tracing::info!(%task_id, %target, "Served from cache");
            }
            ExtractionEvent::CacheMiss { task_id } => {
                tracing::debug!(%task_id, "Cache miss");
            }
            ExtractionEvent::Coalesced { task_id } => {
                tracing::debug!(%task_id, "Waiting for in-flight extraction of the same key");
            }
            ExtractionEvent::AttemptStarted {
                task_id,
                attempt,
                proxy_id,
            } => {
                tracing::info!(%task_id, attempt, proxy = proxy_id.unwrap_or("direct"), "Attempt started");
            }
            ExtractionEvent::CoolingDown { task_id, remaining } => {
                tracing::info!(%task_id, remaining_ms = remaining.as_millis() as u64, "Waiting out block cooldown");
            }
            ExtractionEvent::Classified {
                task_id,
                verdict,
                detail,
            } => match verdict {
                Verdict::Clear => tracing::debug!(%task_id, %detail, "Page clear"),
                Verdict::Suspicious => tracing::warn!(%task_id, %detail, "Page looks suspicious"),
                Verdict::Blocked => tracing::warn!(%task_id, %detail, "Page blocked"),
            },
            ExtractionEvent::SessionRefreshed { session_id, reason } => {
                tracing::info!(%session_id, %reason, "Started new browsing session");
            }
            ExtractionEvent::Retrying {
                task_id,
                attempt,
                delay,
                error,
            } => {
                tracing::warn!(%task_id, attempt, delay_ms = delay.as_millis() as u64, %error, "Attempt failed, retrying");
            }
            ExtractionEvent::Completed {
                task_id,
                attempts,
                timing_ms,
            } => {
                tracing::info!(%task_id, attempts, timing_ms, "Extraction completed");
            }
            ExtractionEvent::Failed {
                task_id,
                attempts,
                error,
            } => {
                tracing::warn!(%task_id, attempts, kind = %error.kind(), %error, "Extraction failed");
            }
        }
    }
}

/// Combined reporting view.
#[derive(Debug, Clone, Serialize)]
pub struct HarvesterReport {
    pub cache: CacheStats,
    pub proxies: ProxyStats,
    pub anti_block: AntiBlockReport,
    pub pool: PoolStats,
}

/// Active browsing identity, loaded lazily from the store.
#[derive(Debug, Default)]
struct SessionSlot {
    loaded: bool,
    current: Option<Session>,
}

/// Coordinates cache, proxies, block detection, retries, pacing and the
/// execution pool for every extraction.
pub struct Orchestrator<F: ContextFactory, X: FieldExtractor> {
    config: HarvesterConfig,
    cache: Arc<ResultCache>,
    proxies: Arc<ProxyManager>,
    detector: Arc<AntiBlockDetector>,
    retry: RetryController,
    pool: ExecutionPool<F>,
    pacer: Pacer,
    sessions: SessionStore,
    persist_sessions: bool,
    session: tokio::sync::Mutex<SessionSlot>,
    extractor: X,
    in_flight: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
    reporter: Box<dyn ExtractionReporter>,
}

impl<F: ContextFactory, X: FieldExtractor> Orchestrator<F, X> {
    /// Builds an orchestrator with fresh shared state, no proxies, a
    /// persisted session store and tracing-based reporting.
    pub fn new(config: HarvesterConfig, factory: F, extractor: X) -> Self {
        Self {
            cache: Arc::new(ResultCache::new(config.cache.clone())),
            proxies: Arc::new(ProxyManager::new(config.proxy.clone(), Vec::new())),
            detector: Arc::new(AntiBlockDetector::new(config.anti_block.clone())),
            retry: RetryController::new(config.retry.clone()),
            pool: ExecutionPool::new(factory, config.pool.clone()),
            pacer: Pacer::new(config.pacing.clone()),
            sessions: SessionStore::new(config.session.clone()),
            persist_sessions: true,
            session: tokio::sync::Mutex::new(SessionSlot::default()),
            extractor,
            in_flight: Mutex::new(HashMap::new()),
            reporter: Box::new(TracingReporter),
            config,
        }
    }

    pub fn with_proxies(mut self, proxies: Arc<ProxyManager>) -> Self {
        self.proxies = proxies;
        self
    }

    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_detector(mut self, detector: Arc<AntiBlockDetector>) -> Self {
        self.detector = detector;
        self
    }

    /// Keep the session in memory only; the snapshot file is never touched.
    pub fn without_session_persistence(mut self) -> Self {
        self.persist_sessions = false;
        self
    }

    pub fn with_reporter(mut self, reporter: impl ExtractionReporter + 'static) -> Self {
        self.reporter = Box::new(reporter);
        self
    }

    pub fn config(&self) -> &HarvesterConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    pub fn proxies(&self) -> &Arc<ProxyManager> {
        &self.proxies
    }

    pub fn detector(&self) -> &Arc<AntiBlockDetector> {
        &self.detector
    }

    pub fn pool(&self) -> &ExecutionPool<F> {
        &self.pool
    }

    /// Runs one extraction to a terminal result. Never fails; every error
    /// is folded into the returned [`ExtractionResult`].
    pub async fn extract(&self, target: &str, auxiliary: Option<&str>) -> ExtractionResult {
        let started = Instant::now();

        let key = match TargetKey::parse(target, auxiliary) {
            Ok(key) => key,
            Err(e) => {
                self.reporter.report(ExtractionEvent::Failed {
                    task_id: Uuid::nil(),
                    attempts: 0,
                    error: &e,
                });
                return failure(target, &e, started, 0);
            }
        };

        let mut task =
            ExtractionTask::new(key, util::instant_after(started, self.config.timeouts.total));
        self.reporter.report(ExtractionEvent::Received {
            task_id: task.id,
            target: &task.key.url,
        });

        if let Some(result) = self.cached(&task) {
            return result;
        }
        self.reporter
            .report(ExtractionEvent::CacheMiss { task_id: task.id });

        // Held until this task finishes so followers see the cached payload.
        let _gate = if self.config.coalesce_in_flight {
            match self.enter_key(&task).await {
                Ok((gate, waited)) => {
                    if waited && let Some(result) = self.cached(&task) {
                        return result;
                    }
                    Some(gate)
                }
                Err(e) => return self.fail(&task, e),
            }
        } else {
            None
        };

        match self.run_attempts(&mut task).await {
            Ok(payload) => {
                let timing_ms = task.elapsed().as_millis() as u64;
                self.reporter.report(ExtractionEvent::Completed {
                    task_id: task.id,
                    attempts: task.attempt,
                    timing_ms,
                });
                ExtractionResult {
                    target: task.key.url,
                    outcome: Outcome::Success { payload },
                    timing_ms,
                    served_from_cache: false,
                    attempts: task.attempt,
                }
            }
            Err(e) => self.fail(&task, e),
        }
    }

    pub fn report(&self) -> HarvesterReport {
        HarvesterReport {
            cache: self.cache.stats(),
            proxies: self.proxies.stats(),
            anti_block: self.detector.report(),
            pool: self.pool.stats(),
        }
    }

    fn cached(&self, task: &ExtractionTask) -> Option<ExtractionResult> {
        let payload = self.cache.get(&task.key.cache_key)?;
        self.reporter.report(ExtractionEvent::CacheHit {
            task_id: task.id,
            target: &task.key.url,
        });
        Some(ExtractionResult {
            target: task.key.url.clone(),
            outcome: Outcome::Success { payload },
            timing_ms: task.elapsed().as_millis() as u64,
            served_from_cache: true,
            attempts: 0,
        })
    }

    fn fail(&self, task: &ExtractionTask, error: AppError) -> ExtractionResult {
        self.reporter.report(ExtractionEvent::Failed {
            task_id: task.id,
            attempts: task.attempt,
            error: &error,
        });
        failure(&task.key.url, &error, task.started_at, task.attempt)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, Weak<tokio::sync::Mutex<()>>>> {
        self.in_flight.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned in-flight mutex");
            poisoned.into_inner()
        })
    }

    /// Serializes tasks for the same key. Returns the gate guard and whether
    /// this task had to wait behind another one.
    async fn enter_key(&self, task: &ExtractionTask) -> Result<(OwnedMutexGuard<()>, bool), AppError> {
        let gate = {
            let mut in_flight = self.lock_in_flight();
            in_flight.retain(|_, gate| gate.strong_count() > 0);
            match in_flight.get(&task.key.cache_key).and_then(Weak::upgrade) {
                Some(gate) => gate,
                None => {
                    let gate = Arc::new(tokio::sync::Mutex::new(()));
                    in_flight.insert(task.key.cache_key.clone(), Arc::downgrade(&gate));
                    gate
                }
            }
        };

        if let Ok(guard) = Arc::clone(&gate).try_lock_owned() {
            return Ok((guard, false));
        }

        self.reporter
            .report(ExtractionEvent::Coalesced { task_id: task.id });
        let guard = tokio::time::timeout_at(task.deadline, gate.lock_owned())
            .await
            .map_err(|_| AppError::timeout("in-flight wait", task.elapsed()))?;
        Ok((guard, true))
    }

    async fn run_attempts(&self, task: &mut ExtractionTask) -> Result<serde_json::Value, AppError> {
        let max_attempts = self.retry.policy().max_attempts.max(1);
        let mut extraction_failures = 0;

        loop {
            task.attempt += 1;
            let attempt = task.attempt;

            let error = match self.attempt(task).await {
                Ok(payload) => return Ok(payload),
                Err(e) => e,
            };
            if error.kind() == ErrorKind::Extraction {
                extraction_failures += 1;
            }
            if attempt >= max_attempts {
                return Err(error);
            }

            if error.kind() == ErrorKind::BlockDetected {
                // The next attempt waits out the cooldown before acquiring.
                self.reporter.report(ExtractionEvent::Retrying {
                    task_id: task.id,
                    attempt,
                    delay: self.detector.cooldown_remaining().unwrap_or_default(),
                    error: &error,
                });
                continue;
            }

            match self.retry.decide(attempt, &error, extraction_failures) {
                RetryDecision::Retry(delay) => {
                    let resume = Instant::now().checked_add(delay);
                    if resume.is_none_or(|at| at >= task.deadline) {
                        tracing::debug!(task_id = %task.id, "Backoff would overrun the deadline");
                        return Err(AppError::timeout("retry backoff", task.elapsed()));
                    }
                    self.reporter.report(ExtractionEvent::Retrying {
                        task_id: task.id,
                        attempt,
                        delay,
                        error: &error,
                    });
                    tokio::time::sleep(delay).await;
                }
                RetryDecision::GiveUp => return Err(error),
            }
        }
    }

    /// One pass through Acquiring, Executing and Classifying.
    async fn attempt(&self, task: &mut ExtractionTask) -> Result<serde_json::Value, AppError> {
        // Acquiring
        let proxy = self.proxies.next();
        if proxy.is_none() && self.config.proxy.required {
            return Err(AppError::ResourceExhausted(
                "no healthy proxy available and one is required".into(),
            ));
        }
        task.proxy = proxy.clone();
        self.reporter.report(ExtractionEvent::AttemptStarted {
            task_id: task.id,
            attempt: task.attempt,
            proxy_id: proxy.as_ref().map(|p| p.id.as_str()),
        });

        self.wait_out_cooldown(task).await?;
        if let Some(host) = task.key.host() {
            self.pacer.wait_turn(&host, task.deadline).await?;
        }
        let session = self.current_session().await;
        let mut context = self.pool.acquire(task.deadline).await?;

        // Executing
        let Some(remaining) = task.remaining() else {
            return Err(AppError::timeout("executing", task.elapsed()));
        };
        let budget = remaining.min(self.config.timeouts.extraction);
        let request = NavigationRequest {
            url: task.key.url.clone(),
            proxy: proxy.clone(),
            user_agent: Some(session.user_agent.clone()),
            cookies: session.cookies.clone(),
            timeout: budget.min(self.config.timeouts.navigation),
        };

        let nav_started = Instant::now();
        let navigated = tokio::time::timeout(budget, context.navigate(&request)).await;
        let page = match navigated {
            Ok(Ok(page)) => page,
            Ok(Err(e)) => {
                self.penalize(proxy.as_ref(), &e);
                return Err(e);
            }
            Err(_) => {
                context.discard();
                let e = AppError::timeout("navigation", nav_started.elapsed());
                self.penalize(proxy.as_ref(), &e);
                return Err(e);
            }
        };
        let latency = nav_started.elapsed();
        drop(context);

        // Classifying
        let detection = self.detector.classify(&page);
        let summary = detection.summary();
        self.reporter.report(ExtractionEvent::Classified {
            task_id: task.id,
            verdict: detection.verdict,
            detail: &summary,
        });

        if detection.verdict == Verdict::Blocked {
            self.detector.record_block();
            if let Some(p) = &proxy {
                self.proxies.record_failure(&p.id);
            }
            self.drop_session("blocked").await;
            return Err(AppError::BlockDetected(summary));
        }

        // A denial status on a normal-sized page is not the data we came
        // for; it must not be cached or credited to the proxy.
        if detection.verdict == Verdict::Suspicious
            && detection
                .signals
                .iter()
                .any(|s| matches!(s, BlockSignal::Status(_)))
        {
            return Err(AppError::ExtractionError(format!("access denied: {summary}")));
        }

        let payload = self
            .extractor
            .extract(&page, task.key.auxiliary.as_deref())?;

        self.cache.put_default(task.key.cache_key.clone(), payload.clone());
        if let Some(p) = &proxy {
            self.proxies.record_success(&p.id, latency);
        }
        if detection.verdict == Verdict::Clear {
            self.detector.record_success();
        }
        self.remember_session(&page).await;

        Ok(payload)
    }

    async fn wait_out_cooldown(&self, task: &ExtractionTask) -> Result<(), AppError> {
        let Some(until) = self.detector.cooldown_until() else {
            return Ok(());
        };
        if until > task.deadline {
            return Err(AppError::timeout("cooldown", task.elapsed()));
        }
        self.reporter.report(ExtractionEvent::CoolingDown {
            task_id: task.id,
            remaining: until.saturating_duration_since(Instant::now()),
        });
        tokio::time::sleep_until(until).await;
        Ok(())
    }

    fn penalize(&self, proxy: Option<&Proxy>, error: &AppError) {
        if let Some(p) = proxy
            && error.should_penalize_proxy()
        {
            self.proxies.record_failure(&p.id);
        }
    }

    /// Returns a copy of the active session, loading it on first use and
    /// replacing it once stale.
    async fn current_session(&self) -> Session {
        let mut slot = self.session.lock().await;

        if !slot.loaded {
            slot.loaded = true;
            if self.persist_sessions {
                match self.sessions.load() {
                    Ok(loaded) => slot.current = loaded,
                    Err(e) => tracing::warn!(error = %e, "Failed to load session snapshot"),
                }
            }
        }

        let stale = slot
            .current
            .as_ref()
            .is_some_and(|s| s.is_expired() || self.sessions.needs_refresh(s));
        if stale || slot.current.is_none() {
            let fresh = Session::fresh(self.sessions.timeout());
            self.reporter.report(ExtractionEvent::SessionRefreshed {
                session_id: fresh.id,
                reason: if stale { "stale" } else { "none active" },
            });
            slot.current = Some(fresh);
        }

        slot.current
            .get_or_insert_with(|| Session::fresh(self.sessions.timeout()))
            .clone()
    }

    async fn drop_session(&self, reason: &str) {
        let mut slot = self.session.lock().await;
        if let Some(old) = slot.current.take() {
            tracing::info!(session_id = %old.id, %reason, "Discarding browsing session");
        }
        if self.persist_sessions
            && let Err(e) = self.sessions.clear()
        {
            tracing::warn!(error = %e, "Failed to clear session snapshot");
        }
    }

    async fn remember_session(&self, page: &PageSnapshot) {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.current.as_mut() else {
            return;
        };
        session.merge_cookies(page.cookies.iter().cloned());
        session.touch(Some(&page.final_url));

        if self.persist_sessions
            && let Err(e) = self.sessions.save(session)
        {
            tracing::warn!(session_id = %session.id, error = %e, "Failed to save session snapshot");
        }
    }
}

fn failure(target: &str, error: &AppError, started: Instant, attempts: u32) -> ExtractionResult {
    ExtractionResult {
        target: target.to_string(),
        outcome: Outcome::Failure {
            kind: error.kind(),
            message: error.to_string(),
        },
        timing_ms: started.elapsed().as_millis() as u64,
        served_from_cache: false,
        attempts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TimeoutConfig;
    use crate::pacing::PacingConfig;
    use crate::proxy::{ProxyPoolConfig, ProxyProtocol};
    use crate::retry::RetryPolicy;
    use crate::testutil::*;
    use crate::models::Cookie;

    const URL: &str = "https://example.com/item/1";

    fn test_config() -> HarvesterConfig {
        let mut config = HarvesterConfig::default();
        config.pacing = PacingConfig::disabled();
        config.retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_jitter: Duration::ZERO,
            max_extraction_retries: 1,
        };
        config.anti_block.initial_cooldown = Duration::from_secs(5);
        config.anti_block.max_cooldown = Duration::from_secs(20);
        config.timeouts = TimeoutConfig {
            navigation: Duration::from_secs(10),
            extraction: Duration::from_secs(15),
            total: Duration::from_secs(600),
        };
        config
    }

    fn orchestrator(
        factory: MockContextFactory,
        config: HarvesterConfig,
    ) -> (Orchestrator<MockContextFactory, MockFieldExtractor>, RecordingReporter) {
        let reporter = RecordingReporter::new();
        let orch = Orchestrator::new(config, factory, MockFieldExtractor::new())
            .without_session_persistence()
            .with_reporter(reporter.clone());
        (orch, reporter)
    }

    fn proxy(id: &str) -> Proxy {
        Proxy {
            id: id.into(),
            host: "10.0.0.1".into(),
            port: 8080,
            protocol: ProxyProtocol::Http,
            credentials: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_is_cached_and_second_call_served_from_cache() {
        let factory = MockContextFactory::new(html_page(URL, "Item one"));
        let (orch, reporter) = orchestrator(factory.clone(), test_config());

        let first = orch.extract(URL, None).await;
        assert!(first.is_success(), "{first:?}");
        assert_eq!(first.payload().unwrap()["title"], "Item one");
        assert!(!first.served_from_cache);
        assert_eq!(first.attempts, 1);

        let second = orch.extract(URL, None).await;
        assert!(second.served_from_cache);
        assert_eq!(second.payload(), first.payload());
        assert_eq!(factory.navigations(), 1);
        assert_eq!(reporter.count("cache_hit"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_target_is_validation_error_without_attempts() {
        let factory = MockContextFactory::new(html_page(URL, "x"));
        let (orch, _) = orchestrator(factory.clone(), test_config());

        let result = orch.extract("ftp://example.com/file", None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Validation));
        assert_eq!(result.attempts, 0);
        assert_eq!(factory.navigations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_network_error_is_retried() {
        let factory = MockContextFactory::with_responses(
            vec![Err(AppError::NetworkError("connection reset".into()))],
            Ok(html_page(URL, "Recovered")),
        );
        let (orch, reporter) = orchestrator(factory.clone(), test_config());

        let result = orch.extract(URL, None).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.attempts, 2);
        assert_eq!(reporter.count("retrying"), 1);
        // The broken context was replaced.
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_timeouts_exhaust_attempts() {
        let factory = MockContextFactory::with_error(AppError::timeout(
            "navigation",
            Duration::from_secs(10),
        ));
        let (orch, _) = orchestrator(factory.clone(), test_config());

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert_eq!(result.attempts, 3);
        assert_eq!(factory.navigations(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn hung_navigation_times_out_and_releases_context() {
        let factory =
            MockContextFactory::new(html_page(URL, "slow")).with_delay(Duration::from_secs(60));
        let mut config = test_config();
        config.retry.max_attempts = 1;
        let (orch, _) = orchestrator(factory, config);

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        let pool = orch.report().pool;
        assert_eq!(pool.active, 0);
        assert_eq!(pool.discarded, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn block_escalates_cooldown_and_quarantines_proxy() {
        let factory = MockContextFactory::with_responses(
            vec![Ok(blocked_page(URL))],
            Ok(html_page(URL, "After cooldown")),
        );
        let (orch, reporter) = orchestrator(factory, test_config());
        let orch = orch.with_proxies(Arc::new(ProxyManager::new(
            ProxyPoolConfig::default(),
            vec![proxy("p1"), proxy("p2")],
        )));

        let start = Instant::now();
        let result = orch.extract(URL, None).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.attempts, 2);
        // Second attempt waited out the 5s cooldown.
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(reporter.count("cooling_down"), 1);
        assert!(orch.proxies().is_quarantined("p1"));

        let stats = orch.proxies().stats();
        assert_eq!(stats.proxies[1].success_count, 1);
        assert_eq!(orch.detector().state().consecutive_block_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_block_surfaces_block_detected() {
        let factory = MockContextFactory::new(blocked_page(URL));
        let (orch, _) = orchestrator(factory.clone(), test_config());

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::BlockDetected));
        assert_eq!(result.attempts, 3);
        assert_eq!(factory.navigations(), 3);

        let report = orch.report().anti_block;
        assert_eq!(report.consecutive_block_count, 3);
        assert_eq!(report.current_cooldown_ms, 20_000);
        assert!(!orch.cache().contains(&TargetKey::parse(URL, None).unwrap().cache_key));
    }

    #[tokio::test(start_paused = true)]
    async fn extraction_errors_get_limited_retries() {
        let page = PageSnapshot::new(URL, Some(200), "<html><body>".to_string() + &"x".repeat(600));
        let factory = MockContextFactory::new(page);
        let mut config = test_config();
        config.retry.max_attempts = 5;
        let (orch, _) = orchestrator(factory.clone(), config);

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Extraction));
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn required_proxy_without_any_is_resource_exhausted() {
        let factory = MockContextFactory::new(html_page(URL, "x"));
        let mut config = test_config();
        config.proxy.required = true;
        let (orch, _) = orchestrator(factory.clone(), config);

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::ResourceExhausted));
        assert_eq!(result.attempts, 1);
        assert_eq!(factory.navigations(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn session_identity_and_cookies_flow_into_requests() {
        let mut page = html_page(URL, "With cookie");
        page.cookies.push(Cookie::new("sid", "abc"));
        let factory = MockContextFactory::new(page);
        let (orch, _) = orchestrator(factory.clone(), test_config());

        orch.extract(URL, None).await;
        orch.extract("https://example.com/item/2", None).await;

        let requests = factory.requests();
        assert_eq!(requests.len(), 2);
        assert!(requests[0].cookies.is_empty());
        assert_eq!(requests[1].cookies, vec![Cookie::new("sid", "abc")]);
        assert_eq!(requests[0].user_agent, requests[1].user_agent);
    }

    fn failure_message(result: &ExtractionResult) -> &str {
        match &result.outcome {
            Outcome::Failure { message, .. } => message,
            Outcome::Success { .. } => panic!("expected a failure, got {result:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn denial_status_is_not_cached_or_credited() {
        let mut denied = html_page(URL, "Forbidden");
        denied.status = Some(403);
        let factory = MockContextFactory::new(denied);
        let (orch, _) = orchestrator(factory.clone(), test_config());
        let orch = orch.with_proxies(Arc::new(ProxyManager::new(
            ProxyPoolConfig::default(),
            vec![proxy("p1")],
        )));

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Extraction));
        assert!(failure_message(&result).contains("HTTP 403"), "{result:?}");
        assert_eq!(factory.navigations(), 2);

        let key = TargetKey::parse(URL, None).unwrap();
        assert!(!orch.cache().contains(&key.cache_key));
        let proxy = &orch.proxies().stats().proxies[0];
        assert_eq!(proxy.success_count, 0);
        assert_eq!(proxy.failure_count, 0);
        assert_eq!(orch.detector().state().consecutive_block_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn denial_status_recovers_on_retry() {
        let mut denied = html_page(URL, "Forbidden");
        denied.status = Some(401);
        let factory =
            MockContextFactory::with_responses(vec![Ok(denied)], Ok(html_page(URL, "Welcome")));
        let (orch, _) = orchestrator(factory, test_config());

        let result = orch.extract(URL, None).await;
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.payload().unwrap()["title"], "Welcome");
        assert_eq!(result.attempts, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_wait_is_bounded_by_the_deadline() {
        let factory = MockContextFactory::new(html_page(URL, "x"));
        let mut config = test_config();
        config.timeouts.total = Duration::from_secs(2);
        let (orch, reporter) = orchestrator(factory.clone(), config);

        // Another extraction of the same key holds the gate throughout.
        let holder = ExtractionTask::new(
            TargetKey::parse(URL, None).unwrap(),
            Instant::now() + Duration::from_secs(60),
        );
        let (_gate, waited) = orch.enter_key(&holder).await.unwrap();
        assert!(!waited);

        let start = Instant::now();
        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(failure_message(&result).contains("in-flight wait"), "{result:?}");
        assert!(start.elapsed() >= Duration::from_secs(2));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(reporter.count("coalesced"), 1);
        assert_eq!(factory.navigations(), 0);
        assert_eq!(orch.report().pool.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_past_the_deadline_fails_fast() {
        let factory = MockContextFactory::with_error(AppError::NetworkError("reset".into()));
        let mut config = test_config();
        config.timeouts.total = Duration::from_secs(10);
        config.retry.base_delay = Duration::from_secs(20);
        let (orch, reporter) = orchestrator(factory.clone(), config);

        let start = Instant::now();
        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(failure_message(&result).contains("retry backoff"), "{result:?}");
        assert_eq!(result.attempts, 1);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(reporter.count("retrying"), 0);
        assert_eq!(orch.report().pool.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_backoff_is_treated_as_past_the_deadline() {
        let factory = MockContextFactory::with_error(AppError::NetworkError("reset".into()));
        let mut config = test_config();
        config.retry.max_attempts = 5;
        config.retry.multiplier = 1e300;
        let (orch, _) = orchestrator(factory.clone(), config);

        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(failure_message(&result).contains("retry backoff"), "{result:?}");
        assert_eq!(factory.navigations(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_ending_after_the_deadline_fails_fast() {
        let factory = MockContextFactory::new(html_page(URL, "x"));
        let mut config = test_config();
        config.timeouts.total = Duration::from_secs(3);
        let (orch, _) = orchestrator(factory.clone(), config);
        assert_eq!(orch.detector().record_block(), Duration::from_secs(5));

        let start = Instant::now();
        let result = orch.extract(URL, None).await;
        assert_eq!(result.error_kind(), Some(ErrorKind::Timeout));
        assert!(failure_message(&result).contains("cooldown"), "{result:?}");
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(factory.navigations(), 0);
        assert_eq!(orch.report().pool.active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_requests_for_one_key_execute_once() {
        let factory =
            MockContextFactory::new(html_page(URL, "Shared")).with_delay(Duration::from_millis(200));
        let (orch, reporter) = orchestrator(factory.clone(), test_config());
        let orch = Arc::new(orch);

        let a = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.extract(URL, None).await }
        });
        let b = tokio::spawn({
            let orch = Arc::clone(&orch);
            async move { orch.extract(URL, None).await }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert!(a.is_success() && b.is_success());
        assert_eq!(factory.navigations(), 1);
        assert!(a.served_from_cache ^ b.served_from_cache);
        assert_eq!(reporter.count("coalesced"), 1);
    }
}
