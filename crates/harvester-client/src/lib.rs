//! Execution engines and a generic field extractor for Harvester.

#[cfg(feature = "browser")]
pub mod browser;
pub mod document;
pub mod http;

#[cfg(feature = "browser")]
pub use browser::{BrowserContext, BrowserContextFactory, BrowserEngineConfig};
pub use document::{DocumentExtractor, DocumentFields, DocumentItem};
pub use http::{HttpContext, HttpContextFactory, HttpEngineConfig};
