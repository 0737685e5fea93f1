//! Test utilities: mock implementations of the core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration
//! tests. All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AppError;
use crate::models::{NavigationRequest, PageSnapshot};
use crate::orchestrator::{ExtractionEvent, ExtractionReporter};
use crate::traits::{ContextFactory, ExecutionContext, FieldExtractor};

// ---------------------------------------------------------------------------
// MockContextFactory / MockContext
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockShared {
    /// Scripted responses. Each navigation pops the first element; when
    /// empty, `fallback` is returned.
    script: Mutex<VecDeque<Result<PageSnapshot, AppError>>>,
    fallback: Mutex<Option<Result<PageSnapshot, AppError>>>,
    requests: Mutex<Vec<NavigationRequest>>,
    delay: Mutex<Duration>,
    created: AtomicU32,
    navigations: AtomicU32,
    active: AtomicU32,
    max_active: AtomicU32,
}

/// Mock factory whose contexts replay scripted page outcomes.
#[derive(Clone, Default)]
pub struct MockContextFactory {
    shared: Arc<MockShared>,
}

impl MockContextFactory {
    /// Every navigation returns `page`.
    pub fn new(page: PageSnapshot) -> Self {
        let factory = Self::default();
        *factory.shared.fallback.lock().unwrap() = Some(Ok(page));
        factory
    }

    /// Every navigation fails with `error`.
    pub fn with_error(error: AppError) -> Self {
        let factory = Self::default();
        *factory.shared.fallback.lock().unwrap() = Some(Err(error));
        factory
    }

    /// Navigations replay `responses` in order, then `fallback`.
    pub fn with_responses(
        responses: Vec<Result<PageSnapshot, AppError>>,
        fallback: Result<PageSnapshot, AppError>,
    ) -> Self {
        let factory = Self::default();
        *factory.shared.script.lock().unwrap() = responses.into();
        *factory.shared.fallback.lock().unwrap() = Some(fallback);
        factory
    }

    /// Each navigation takes `delay` of (tokio) time.
    pub fn with_delay(self, delay: Duration) -> Self {
        *self.shared.delay.lock().unwrap() = delay;
        self
    }

    pub fn created(&self) -> u32 {
        self.shared.created.load(Ordering::SeqCst)
    }

    pub fn navigations(&self) -> u32 {
        self.shared.navigations.load(Ordering::SeqCst)
    }

    /// Highest number of navigations observed in flight at once.
    pub fn max_concurrent(&self) -> u32 {
        self.shared.max_active.load(Ordering::SeqCst)
    }

    /// Every request seen so far, in order.
    pub fn requests(&self) -> Vec<NavigationRequest> {
        self.shared.requests.lock().unwrap().clone()
    }
}

impl ContextFactory for MockContextFactory {
    type Context = MockContext;

    async fn create(&self) -> Result<MockContext, AppError> {
        let id = self.shared.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockContext {
            id,
            usable: true,
            shared: Arc::clone(&self.shared),
        })
    }
}

/// Context handed out by [`MockContextFactory`]. A network error leaves
/// it unusable, like a real engine whose connection dropped.
pub struct MockContext {
    pub id: u32,
    usable: bool,
    shared: Arc<MockShared>,
}

impl ExecutionContext for MockContext {
    async fn navigate(&mut self, request: &NavigationRequest) -> Result<PageSnapshot, AppError> {
        self.shared.requests.lock().unwrap().push(request.clone());
        self.shared.navigations.fetch_add(1, Ordering::SeqCst);
        let active = self.shared.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_active.fetch_max(active, Ordering::SeqCst);

        let delay = *self.shared.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.shared.active.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.shared.script.lock().unwrap().pop_front();
        let result = match scripted {
            Some(result) => result,
            None => self
                .shared
                .fallback
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Ok(PageSnapshot::new(&request.url, Some(200), ""))),
        };

        if let Err(AppError::NetworkError(_)) = &result {
            self.usable = false;
        }
        result.map(|mut page| {
            if page.final_url.is_empty() {
                page.final_url = request.url.clone();
            }
            page
        })
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

// ---------------------------------------------------------------------------
// MockFieldExtractor
// ---------------------------------------------------------------------------

/// Mock extractor that reads the `<title>` of the page.
#[derive(Clone, Default)]
pub struct MockFieldExtractor {
    calls: Arc<AtomicU32>,
}

impl MockFieldExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FieldExtractor for MockFieldExtractor {
    fn extract(
        &self,
        page: &PageSnapshot,
        auxiliary: Option<&str>,
    ) -> Result<serde_json::Value, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let title = page
            .content
            .split_once("<title>")
            .and_then(|(_, rest)| rest.split_once("</title>"))
            .map(|(title, _)| title.trim())
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AppError::ExtractionError("page has no title".into()))?;

        Ok(serde_json::json!({
            "title": title,
            "url": page.final_url,
            "auxiliary": auxiliary,
        }))
    }
}

/// An HTML page of realistic size with the given title.
pub fn html_page(url: &str, title: &str) -> PageSnapshot {
    let filler = "<p>Lorem ipsum dolor sit amet, consectetur adipiscing elit.</p>".repeat(20);
    PageSnapshot::new(
        url,
        Some(200),
        format!("<html><head><title>{title}</title></head><body>{filler}</body></html>"),
    )
}

/// A throttling response: HTTP 429 with a challenge page.
pub fn blocked_page(url: &str) -> PageSnapshot {
    PageSnapshot::new(
        url,
        Some(429),
        "<html><body>Too many requests. Please complete the CAPTCHA.</body></html>",
    )
}

// ---------------------------------------------------------------------------
// RecordingReporter
// ---------------------------------------------------------------------------

/// Reporter that records the name of each event.
#[derive(Clone, Default)]
pub struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.events.lock().unwrap().iter().filter(|e| *e == name).count()
    }
}

impl ExtractionReporter for RecordingReporter {
    fn report(&self, event: ExtractionEvent<'_>) {
        self.events.lock().unwrap().push(event.name().to_string());
    }
}
