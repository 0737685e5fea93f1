use std::path::PathBuf;
use std::sync::Arc;

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::emulation::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::{CookieParam, TimeSinceEpoch};
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::page::Page;
use futures::StreamExt;
use harvester_core::error::AppError;
use harvester_core::models::{Cookie, NavigationRequest, PageSnapshot};
use harvester_core::traits::{ContextFactory, ExecutionContext};

/// Launch settings for the shared Chromium process.
#[derive(Debug, Clone, Default)]
pub struct BrowserEngineConfig {
    /// Explicit binary; otherwise `CHROME_BIN` and well-known paths are tried.
    pub chrome_executable: Option<PathBuf>,
    /// Extra command-line flags appended after the defaults.
    pub extra_args: Vec<String>,
}

/// Headless-browser engine using Chromium via the Chrome DevTools Protocol.
///
/// Unlike [`HttpContextFactory`](crate::HttpContextFactory), this renders
/// JavaScript before returning the HTML, making it suitable for SPAs and
/// pages with lazy-loaded content.
///
/// A single Chromium process is shared by every context; each navigation
/// runs in its own CDP browser context (separate cookie jar and cache)
/// with the selected proxy applied, which is disposed afterwards.
///
/// # Example
///
/// ```rust,no_run
/// use harvester_client::{BrowserContextFactory, BrowserEngineConfig};
/// use harvester_core::traits::{ContextFactory, ExecutionContext};
/// use harvester_core::models::NavigationRequest;
/// use std::time::Duration;
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let factory = BrowserContextFactory::launch(BrowserEngineConfig::default()).await?;
/// let mut context = factory.create().await?;
/// let page = context
///     .navigate(&NavigationRequest::new("https://example.com", Duration::from_secs(30)))
///     .await?;
/// println!("{}", &page.content[..200]);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct BrowserContextFactory {
    browser: Arc<Browser>,
}

impl BrowserContextFactory {
    /// Launches a headless Chromium browser.
    pub async fn launch(config: BrowserEngineConfig) -> Result<Self, AppError> {
        let mut builder = BrowserConfig::builder();
        builder = builder.no_sandbox().disable_default_args();

        // Snap-packaged Chromium exposes a wrapper that rejects standard
        // Chrome CLI flags (--headless, --disable-gpu, …). Prefer the real
        // binary, falling back to whatever chromiumoxide finds itself.
        if let Some(bin) = config.chrome_executable.clone().or_else(find_chrome_binary) {
            tracing::info!(binary = %bin.display(), "using Chrome binary");
            builder = builder.chrome_executable(bin);
        }

        builder = builder
            .arg("--headless=new")
            .arg("--disable-gpu")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions")
            .arg("--disable-popup-blocking")
            .arg("--disable-translate")
            .arg("--no-first-run");
        for arg in &config.extra_args {
            builder = builder.arg(arg.as_str());
        }

        let browser_config = builder
            .build()
            .map_err(|e| AppError::ResourceExhausted(format!("Browser config error: {e}")))?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| AppError::ResourceExhausted(format!("Failed to launch browser: {e}")))?;

        // The CDP handler must be polled continuously for the connection to work.
        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    tracing::warn!("Browser CDP handler error: {event:?}");
                    break;
                }
            }
        });

        Ok(Self {
            browser: Arc::new(browser),
        })
    }
}

impl ContextFactory for BrowserContextFactory {
    type Context = BrowserContext;

    async fn create(&self) -> Result<BrowserContext, AppError> {
        Ok(BrowserContext {
            browser: Arc::clone(&self.browser),
            usable: true,
        })
    }
}

/// One execution slot on the shared browser.
pub struct BrowserContext {
    browser: Arc<Browser>,
    usable: bool,
}

impl BrowserContext {
    async fn open_context(
        &self,
        request: &NavigationRequest,
    ) -> Result<BrowserContextId, AppError> {
        let mut params = CreateBrowserContextParams::default();
        if let Some(proxy) = &request.proxy {
            if proxy.credentials.is_some() {
                tracing::warn!(
                    proxy = %proxy.id,
                    "proxy credentials are not forwarded by the browser engine"
                );
            }
            params.proxy_server = Some(proxy.server());
        }
        let response = self
            .browser
            .execute(params)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to create browser context: {e}")))?;
        Ok(response.result.browser_context_id)
    }

    async fn dispose_context(&self, id: BrowserContextId) {
        if let Err(e) = self
            .browser
            .execute(DisposeBrowserContextParams::new(id))
            .await
        {
            tracing::warn!("Failed to dispose browser context: {e}");
        }
    }

    async fn load(
        &self,
        id: BrowserContextId,
        request: &NavigationRequest,
    ) -> Result<PageSnapshot, AppError> {
        let mut target = CreateTargetParams::new("about:blank");
        target.browser_context_id = Some(id);
        let page = self
            .browser
            .new_page(target)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to open tab: {e}")))?;

        let result = render(&page, request).await;
        // Close the tab to free browser resources.
        let _ = page.close().await;
        result
    }
}

async fn render(page: &Page, request: &NavigationRequest) -> Result<PageSnapshot, AppError> {
    if let Some(user_agent) = &request.user_agent {
        page.execute(SetUserAgentOverrideParams::new(user_agent.clone()))
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to set user agent: {e}")))?;
    }
    if !request.cookies.is_empty() {
        let cookies = request
            .cookies
            .iter()
            .map(|c| to_cookie_param(c, &request.url))
            .collect();
        page.set_cookies(cookies)
            .await
            .map_err(|e| AppError::NetworkError(format!("Failed to set cookies: {e}")))?;
    }

    page.goto(request.url.as_str()).await.map_err(|e| {
        AppError::NetworkError(format!("Failed to navigate to {}: {e}", request.url))
    })?;

    // Wait until <body> is present, a minimal signal that the page has
    // rendered its main content.
    page.find_element("body")
        .await
        .map_err(|e| AppError::NetworkError(format!("Page did not render body: {e}")))?;

    let content = page
        .content()
        .await
        .map_err(|e| AppError::NetworkError(format!("Failed to read page content: {e}")))?;
    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .unwrap_or_else(|| request.url.clone());
    let cookies = page
        .get_cookies()
        .await
        .map(|cookies| {
            cookies
                .into_iter()
                .map(|c| Cookie {
                    name: c.name,
                    value: c.value,
                    domain: Some(c.domain.trim_start_matches('.').to_string()),
                    path: Some(c.path),
                    expires: (!c.session && c.expires > 0.0).then_some(c.expires),
                    http_only: c.http_only,
                    secure: c.secure,
                })
                .collect()
        })
        .unwrap_or_default();

    // CDP does not surface the document status through this path; the
    // classifier falls back to content and URL signals.
    Ok(PageSnapshot {
        status: None,
        final_url,
        content,
        cookies,
    })
}

fn to_cookie_param(cookie: &Cookie, url: &str) -> CookieParam {
    let mut param = CookieParam::new(cookie.name.clone(), cookie.value.clone());
    match &cookie.domain {
        Some(domain) => param.domain = Some(domain.clone()),
        None => param.url = Some(url.to_string()),
    }
    param.path = cookie.path.clone();
    param.secure = Some(cookie.secure);
    param.http_only = Some(cookie.http_only);
    param.expires = cookie.expires.map(TimeSinceEpoch::new);
    param
}

impl ExecutionContext for BrowserContext {
    async fn navigate(&mut self, request: &NavigationRequest) -> Result<PageSnapshot, AppError> {
        let id = match self.open_context(request).await {
            Ok(id) => id,
            Err(e) => {
                // The CDP connection is likely gone; let the pool replace us.
                self.usable = false;
                return Err(e);
            }
        };

        let result = tokio::time::timeout(request.timeout, self.load(id.clone(), request)).await;
        self.dispose_context(id).await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(AppError::timeout("navigation", request.timeout)),
        }
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

/// Tries to locate the real Chrome/Chromium binary.
///
/// On systems where Chromium is installed via **snap**, the wrapper at
/// `/snap/bin/chromium` strips unknown CLI flags, breaking headless mode.
/// We look for the real binary inside the snap first, then fall back to
/// well-known system paths. If nothing is found we return `None` and let
/// `chromiumoxide` do its own lookup.
fn find_chrome_binary() -> Option<PathBuf> {
    let candidates: &[&str] = &[
        // Snap (Ubuntu default)
        "/snap/chromium/current/usr/lib/chromium-browser/chrome",
        // Flatpak
        "/var/lib/flatpak/exports/bin/org.chromium.Chromium",
        // Common apt / manual installs
        "/usr/bin/google-chrome-stable",
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
    ];

    // Also honour an explicit override via env var.
    if let Ok(p) = std::env::var("CHROME_BIN") {
        let path = PathBuf::from(&p);
        if path.exists() {
            return Some(path);
        }
    }

    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cookie_param_scoping() {
        let mut scoped = Cookie::new("sid", "1");
        scoped.domain = Some("shop.example.com".into());
        scoped.expires = Some(2_000_000_000.0);
        let param = to_cookie_param(&scoped, "https://shop.example.com/");
        assert_eq!(param.domain.as_deref(), Some("shop.example.com"));
        assert!(param.url.is_none());
        assert!(param.expires.is_some());

        let host_only = Cookie::new("pref", "dark");
        let param = to_cookie_param(&host_only, "https://shop.example.com/a");
        assert_eq!(param.url.as_deref(), Some("https://shop.example.com/a"));
        assert!(param.domain.is_none());
    }
}

