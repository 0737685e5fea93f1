use std::future::Future;

use crate::error::AppError;
use crate::models::{NavigationRequest, PageSnapshot};

/// A reusable execution context (a browser context or an HTTP client with
/// its own cookie jar) that can load one page at a time.
pub trait ExecutionContext: Send + 'static {
    /// Loads the requested page and returns the raw outcome. Block pages are
    /// not errors at this layer; classification happens afterwards.
    fn navigate(
        &mut self,
        request: &NavigationRequest,
    ) -> impl Future<Output = Result<PageSnapshot, AppError>> + Send;

    /// Whether the context may be handed to another task. A context whose
    /// transport broke reports `false` and is discarded by the pool.
    fn is_usable(&self) -> bool {
        true
    }
}

/// Creates execution contexts on demand for the pool.
pub trait ContextFactory: Send + Sync + 'static {
    type Context: ExecutionContext;

    fn create(&self) -> impl Future<Output = Result<Self::Context, AppError>> + Send;
}

/// Turns a loaded page into the structured payload for a target.
///
/// Returns [`AppError::ExtractionError`] when the page loaded but the
/// expected data is absent.
pub trait FieldExtractor: Send + Sync + 'static {
    fn extract(
        &self,
        page: &PageSnapshot,
        auxiliary: Option<&str>,
    ) -> Result<serde_json::Value, AppError>;
}
