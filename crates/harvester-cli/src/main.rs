use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use tracing_subscriber::EnvFilter;

use harvester_client::{DocumentExtractor, HttpContextFactory, HttpEngineConfig};
use harvester_core::traits::ContextFactory;
use harvester_core::{
    HarvesterConfig, Orchestrator, ProxyManager, SessionStore, load_proxy_records,
};

#[derive(Parser)]
#[command(name = "harvester", version, about = "Resilient web extraction")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract one or more targets through the resilience pipeline
    Extract(ExtractArgs),

    /// Inspect or discard the persisted browsing session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Args)]
struct ExtractArgs {
    /// Target URLs, extracted concurrently
    #[arg(required = true)]
    targets: Vec<String>,

    /// Auxiliary identity (element id or data-id) applied to every target
    #[arg(long)]
    aux: Option<String>,

    /// JSON file with the proxy list
    #[arg(long, env = "HARVESTER_PROXY_FILE")]
    proxies: Option<PathBuf>,

    /// Render pages with headless Chromium instead of plain HTTP
    #[arg(long, default_value_t = false)]
    browser: bool,

    /// Print the cache/proxy/anti-block/pool report after the results
    #[arg(long, default_value_t = false)]
    report: bool,

    /// Keep the session in memory instead of the snapshot file
    #[arg(long, default_value_t = false)]
    ephemeral: bool,

    /// Allow targets on private/reserved networks (HTTP engine only)
    #[arg(long, default_value_t = false)]
    allow_private: bool,
}

#[derive(Subcommand)]
enum SessionAction {
    /// Print a summary of the persisted session
    Show,
    /// Delete the persisted session
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr so stdout stays machine-readable.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harvester=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = HarvesterConfig::from_env().context("Invalid HARVESTER_* configuration")?;

    match cli.command {
        Commands::Extract(args) => cmd_extract(config, args).await,
        Commands::Session { action } => cmd_session(&config, action),
    }
}

async fn cmd_extract(config: HarvesterConfig, args: ExtractArgs) -> Result<()> {
    let proxy_file = args.proxies.clone().or_else(|| config.proxy_file.clone());
    let records = match &proxy_file {
        Some(path) => load_proxy_records(path)?,
        None => Vec::new(),
    };
    config.validate_proxies(records.len())?;
    tracing::info!(
        targets = args.targets.len(),
        proxies = records.len(),
        engine = if args.browser { "browser" } else { "http" },
        "Starting extraction"
    );
    let proxies = Arc::new(ProxyManager::from_records(config.proxy.clone(), records));

    if args.browser {
        return run_browser(config, proxies, &args).await;
    }

    let mut engine = HttpEngineConfig::default();
    if args.allow_private {
        engine = engine.allow_private_urls();
    }
    run(HttpContextFactory::new(engine), config, proxies, &args).await
}

#[cfg(feature = "browser")]
async fn run_browser(
    config: HarvesterConfig,
    proxies: Arc<ProxyManager>,
    args: &ExtractArgs,
) -> Result<()> {
    use harvester_client::{BrowserContextFactory, BrowserEngineConfig};

    let factory = BrowserContextFactory::launch(BrowserEngineConfig::default())
        .await
        .context("Failed to launch headless browser")?;
    run(factory, config, proxies, args).await
}

#[cfg(not(feature = "browser"))]
async fn run_browser(_: HarvesterConfig, _: Arc<ProxyManager>, _: &ExtractArgs) -> Result<()> {
    anyhow::bail!("--browser requires harvester to be built with the `browser` feature")
}

async fn run<F: ContextFactory>(
    factory: F,
    config: HarvesterConfig,
    proxies: Arc<ProxyManager>,
    args: &ExtractArgs,
) -> Result<()> {
    let mut orchestrator =
        Orchestrator::new(config, factory, DocumentExtractor::new()).with_proxies(proxies);
    if args.ephemeral {
        orchestrator = orchestrator.without_session_persistence();
    }

    let aux = args.aux.as_deref();
    let concurrency = args.targets.len().max(1);
    let mut results = futures::stream::iter(&args.targets)
        .map(|target| orchestrator.extract(target, aux))
        .buffer_unordered(concurrency);

    let mut failed = 0usize;
    while let Some(result) = results.next().await {
        if !result.is_success() {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&result)?);
    }

    if args.report {
        let report = serde_json::json!({ "report": orchestrator.report() });
        println!("{report}");
    }

    if failed > 0 {
        anyhow::bail!("{failed} of {} extractions failed", args.targets.len());
    }
    Ok(())
}

fn cmd_session(config: &HarvesterConfig, action: SessionAction) -> Result<()> {
    let store = SessionStore::new(config.session.clone());
    match action {
        SessionAction::Show => {
            let session = store
                .load()
                .with_context(|| format!("Failed to read {}", store.path().display()))?;
            let summary = match session {
                Some(session) => serde_json::json!({
                    "path": store.path(),
                    "id": session.id,
                    "userAgent": session.user_agent,
                    "url": session.url,
                    "cookies": session.cookies.iter().map(|c| &c.name).collect::<Vec<_>>(),
                    "createdAt": session.created_at,
                    "lastActivityAt": session.last_activity_at,
                    "expiresAt": session.expires_at,
                    "ageSecs": session.age().as_secs(),
                    "needsRefresh": store.needs_refresh(&session),
                }),
                None => serde_json::json!({ "path": store.path(), "session": null }),
            };
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        SessionAction::Clear => {
            store
                .clear()
                .with_context(|| format!("Failed to delete {}", store.path().display()))?;
            tracing::info!(path = %store.path().display(), "Session cleared");
        }
    }
    Ok(())
}
