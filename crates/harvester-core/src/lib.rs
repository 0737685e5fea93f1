pub mod anti_block;
pub mod cache;
pub mod config;
pub mod error;
pub mod models;
pub mod orchestrator;
pub mod pacing;
pub mod pool;
pub mod proxy;
pub mod retry;
pub mod session;
pub mod traits;
mod util;

#[cfg(any(test, feature = "testutil"))]
pub mod testutil;

pub use anti_block::{AntiBlockConfig, AntiBlockDetector, AntiBlockReport, Verdict};
pub use cache::{CacheConfig, ResultCache};
pub use config::{ConfigError, HarvesterConfig, TimeoutConfig, load_proxy_records};
pub use error::{AppError, ErrorKind};
pub use models::{
    Cookie, ExtractionResult, NavigationRequest, Outcome, PageSnapshot, TargetKey, compute_hash,
};
pub use orchestrator::{
    ExtractionEvent, ExtractionReporter, HarvesterReport, Orchestrator, TracingReporter,
};
pub use pacing::{Pacer, PacingConfig};
pub use pool::{ExecutionPool, PoolConfig, PooledContext};
pub use proxy::{Proxy, ProxyManager, ProxyPoolConfig, ProxyRecord, RotationStrategy};
pub use retry::{RetryController, RetryError, RetryPolicy};
pub use session::{Session, SessionConfig, SessionError, SessionStore};
pub use traits::{ContextFactory, ExecutionContext, FieldExtractor};
