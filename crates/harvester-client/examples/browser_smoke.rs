/// Smoke-test for `BrowserContextFactory`.
///
/// Launches a headless Chromium, loads <https://example.com> through a
/// full orchestrator, and verifies the extracted title.
///
/// Run with:
///   cargo run -p harvester-client --example browser_smoke --features browser
use harvester_client::{BrowserContextFactory, BrowserEngineConfig, DocumentExtractor};
use harvester_core::{HarvesterConfig, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("info,harvester_core=debug")
        .init();

    println!("Launching headless browser…");
    let factory = BrowserContextFactory::launch(BrowserEngineConfig::default()).await?;

    let config = HarvesterConfig::from_env()?;
    let orchestrator = Orchestrator::new(config, factory, DocumentExtractor::new())
        .without_session_persistence();

    let url = "https://example.com";
    println!("Extracting {url} …");
    let result = orchestrator.extract(url, None).await;

    let payload = result
        .payload()
        .ok_or_else(|| anyhow::anyhow!("extraction failed: {result:?}"))?;
    assert_eq!(
        payload["title"], "Example Domain",
        "unexpected title in {payload}"
    );

    println!(
        "OK: {} attempt(s), {} ms",
        result.attempts, result.timing_ms
    );
    println!("{}", serde_json::to_string_pretty(&orchestrator.report())?);
    Ok(())
}
