use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use cookie_store::{CookieDomain, CookieExpiration, CookieStore};
use harvester_core::error::AppError;
use harvester_core::models::{Cookie, NavigationRequest, PageSnapshot};
use harvester_core::proxy::Proxy;
use harvester_core::traits::{ContextFactory, ExecutionContext};
use reqwest::Client;
use reqwest::header::{HeaderValue, USER_AGENT};
use reqwest::redirect::Policy;
use url::Url;

const DEFAULT_USER_AGENT: &str = "Harvester/0.1";

/// Settings shared by every [`HttpContext`] a factory creates.
#[derive(Debug, Clone)]
pub struct HttpEngineConfig {
    /// Sent when the request carries no session user agent.
    pub default_user_agent: String,
    pub connect_timeout: Duration,
    pub max_redirects: usize,
    /// Reject targets that resolve to private/reserved addresses.
    pub ssrf_protection: bool,
}

impl Default for HttpEngineConfig {
    fn default() -> Self {
        Self {
            default_user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(10),
            max_redirects: 10,
            ssrf_protection: true,
        }
    }
}

impl HttpEngineConfig {
    /// Disable SSRF protection, allowing requests to private/reserved IPs.
    ///
    /// Only use this for CLI usage where the user controls the machine.
    pub fn allow_private_urls(mut self) -> Self {
        self.ssrf_protection = false;
        self
    }
}

/// Plain HTTP execution engine using reqwest.
///
/// Downloads raw HTML without running scripts. Each context keeps one
/// client per egress path and rebuilds it when the proxy changes, so
/// connections are reused across navigations through the same proxy.
#[derive(Clone, Default)]
pub struct HttpContextFactory {
    config: Arc<HttpEngineConfig>,
}

impl HttpContextFactory {
    pub fn new(config: HttpEngineConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &HttpEngineConfig {
        &self.config
    }
}

impl ContextFactory for HttpContextFactory {
    type Context = HttpContext;

    async fn create(&self) -> Result<HttpContext, AppError> {
        Ok(HttpContext::new(Arc::clone(&self.config)))
    }
}

/// One reusable HTTP execution context.
pub struct HttpContext {
    config: Arc<HttpEngineConfig>,
    /// Client and the id of the proxy it was built for (`None` = direct).
    client: Option<(Option<String>, Client)>,
    jar: Arc<SessionJar>,
    usable: bool,
}

impl HttpContext {
    fn new(config: Arc<HttpEngineConfig>) -> Self {
        Self {
            config,
            client: None,
            jar: Arc::new(SessionJar::default()),
            usable: true,
        }
    }

    fn client_for(&mut self, proxy: Option<&Proxy>) -> Result<Client, AppError> {
        let wanted = proxy.map(|p| p.id.clone());
        if let Some((current, client)) = &self.client
            && *current == wanted
        {
            return Ok(client.clone());
        }

        let client = build_client(&self.config, proxy, Arc::clone(&self.jar))?;
        tracing::debug!(proxy = ?wanted, "built HTTP client");
        self.client = Some((wanted, client.clone()));
        Ok(client)
    }

    fn map_send_error(&mut self, err: reqwest::Error, request: &NavigationRequest) -> AppError {
        if err.is_timeout() {
            return AppError::timeout("navigation", request.timeout);
        }
        if err.is_connect() {
            // The pooled connections behind this client are suspect now.
            self.usable = false;
            return AppError::NetworkError(format!("Connection failed for {}: {err}", request.url));
        }
        AppError::NetworkError(format!("Request to {} failed: {err}", request.url))
    }
}

impl ExecutionContext for HttpContext {
    async fn navigate(&mut self, request: &NavigationRequest) -> Result<PageSnapshot, AppError> {
        let url = Url::parse(&request.url)
            .map_err(|e| AppError::ValidationError(format!("Invalid URL: {e}")))?;
        // Through a proxy the target is resolved remotely.
        if self.config.ssrf_protection && request.proxy.is_none() {
            validate_url(&request.url).await?;
        }

        let client = self.client_for(request.proxy.as_ref())?;
        self.jar.seed(&request.cookies, &url);
        let mut builder = client.get(url.as_str()).timeout(request.timeout);
        if let Some(user_agent) = &request.user_agent {
            builder = builder.header(USER_AGENT, user_agent);
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) => return Err(self.map_send_error(e, request)),
        };

        let status = response.status();
        let final_url = response.url().clone();

        // 401/403/429 pages are returned as-is for the block classifier.
        if status.is_server_error() {
            return Err(AppError::NetworkError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                request.url
            )));
        }

        let content = response.text().await.map_err(|e| {
            if e.is_timeout() {
                AppError::timeout("navigation", request.timeout)
            } else {
                AppError::NetworkError(format!("Failed to read response body: {e}"))
            }
        })?;
        let cookies = self.jar.export();

        tracing::debug!(
            url = %final_url,
            status = status.as_u16(),
            bytes = content.len(),
            cookies = cookies.len(),
            "page loaded"
        );

        Ok(PageSnapshot {
            status: Some(status.as_u16()),
            final_url: final_url.to_string(),
            content,
            cookies,
        })
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

fn build_client(
    config: &HttpEngineConfig,
    proxy: Option<&Proxy>,
    jar: Arc<SessionJar>,
) -> Result<Client, AppError> {
    let mut builder = Client::builder()
        .user_agent(config.default_user_agent.as_str())
        .connect_timeout(config.connect_timeout)
        .cookie_provider(jar)
        .redirect(Policy::limited(config.max_redirects));

    builder = match proxy {
        Some(proxy) => {
            let mut upstream = reqwest::Proxy::all(proxy.server()).map_err(|e| {
                AppError::ValidationError(format!("Invalid proxy {}: {e}", proxy.id))
            })?;
            if let Some(credentials) = &proxy.credentials {
                upstream = upstream.basic_auth(&credentials.username, &credentials.password);
            }
            builder.proxy(upstream)
        }
        // Ignore HTTP(S)_PROXY from the environment when running direct.
        None => builder.no_proxy(),
    };

    builder
        .build()
        .map_err(|e| AppError::NetworkError(format!("Failed to build HTTP client: {e}")))
}

// ---------------------------------------------------------------------------
// Cookies
// ---------------------------------------------------------------------------

/// Cookie jar handed to reqwest as the client's cookie provider.
///
/// reqwest consults it on every hop, so `Set-Cookie` headers on redirect
/// responses are kept along with the final response's. The jar outlives
/// client rebuilds and is reseeded from the session before each navigation.
#[derive(Default)]
struct SessionJar {
    store: Mutex<CookieStore>,
}

impl SessionJar {
    fn lock(&self) -> MutexGuard<'_, CookieStore> {
        self.store.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("cookie jar lock poisoned, recovering");
            poisoned.into_inner()
        })
    }

    /// Replaces the jar content with the session cookies for `target`.
    fn seed(&self, cookies: &[Cookie], target: &Url) {
        let mut store = self.lock();
        *store = CookieStore::default();
        let now = Utc::now().timestamp() as f64;
        for cookie in cookies {
            let Some((header, origin)) = seed_header(cookie, target, now) else {
                continue;
            };
            if let Err(e) = store.parse(&header, &origin) {
                tracing::debug!(cookie = %cookie.name, "session cookie not seeded: {e}");
            }
        }
    }

    /// Every unexpired cookie currently held, as session records.
    fn export(&self) -> Vec<Cookie> {
        self.lock()
            .iter_unexpired()
            .map(|stored| Cookie {
                name: stored.name().to_string(),
                value: stored.value().to_string(),
                domain: match &stored.domain {
                    CookieDomain::HostOnly(d) | CookieDomain::Suffix(d) => Some(d.clone()),
                    _ => None,
                },
                path: Some(String::from(&stored.path)),
                expires: match &stored.expires {
                    CookieExpiration::AtUtc(at) => Some(at.unix_timestamp() as f64),
                    _ => None,
                },
                http_only: stored.http_only().unwrap_or(false),
                secure: stored.secure().unwrap_or(false),
            })
            .collect()
    }
}

impl reqwest::cookie::CookieStore for SessionJar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        let mut store = self.lock();
        for header in cookie_headers.filter_map(|v| v.to_str().ok()) {
            if let Err(e) = store.parse(header, url) {
                tracing::debug!(%url, "ignoring Set-Cookie: {e}");
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let store = self.lock();
        let pairs: Vec<String> = store
            .get_request_values(url)
            .map(|(name, value)| format!("{name}={value}"))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        HeaderValue::from_str(&pairs.join("; ")).ok()
    }
}

/// Renders a session record as a `Set-Cookie` line plus the origin it is
/// stored under. Domain-scoped records are replayed from their own domain;
/// the rest become host-only cookies of `target`.
fn seed_header(cookie: &Cookie, target: &Url, now: f64) -> Option<(String, Url)> {
    let mut header = format!("{}={}", cookie.name, cookie.value);
    let origin = match &cookie.domain {
        Some(domain) => {
            header.push_str(&format!("; Domain={domain}"));
            Url::parse(&format!("https://{domain}/")).ok()?
        }
        None => target.clone(),
    };
    if let Some(path) = &cookie.path {
        header.push_str(&format!("; Path={path}"));
    }
    if let Some(at) = cookie.expires {
        if at <= now {
            return None;
        }
        header.push_str(&format!("; Max-Age={}", (at - now).ceil() as i64));
    }
    if cookie.secure {
        header.push_str("; Secure");
    }
    if cookie.http_only {
        header.push_str("; HttpOnly");
    }
    Some((header, origin))
}

// ---------------------------------------------------------------------------
// SSRF protection
// ---------------------------------------------------------------------------

/// Validate a URL to prevent server-side request forgery (SSRF).
///
/// 1. Only allow `http` and `https` schemes.
/// 2. Resolve the hostname via DNS.
/// 3. Reject if any resolved IP is private/reserved.
async fn validate_url(url: &str) -> Result<(), AppError> {
    let parsed =
        Url::parse(url).map_err(|e| AppError::ValidationError(format!("Invalid URL: {e}")))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::ValidationError(format!(
                "URL scheme '{scheme}' is not allowed (only http/https)"
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::ValidationError("URL has no host".to_string()))?;

    // IPv6 literals come back bracketed from `host_str`.
    let literal = host.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = literal.parse::<IpAddr>() {
        if is_private_ip(ip) {
            return Err(AppError::ValidationError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP"
            )));
        }
        return Ok(());
    }

    let port = parsed.port_or_known_default().unwrap_or(80);
    let addrs: Vec<_> = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| AppError::NetworkError(format!("DNS resolution failed for {host}: {e}")))?
        .collect();

    if addrs.is_empty() {
        return Err(AppError::NetworkError(format!(
            "DNS resolution returned no addresses for {host}"
        )));
    }

    for socket_addr in &addrs {
        if is_private_ip(socket_addr.ip()) {
            return Err(AppError::ValidationError(format!(
                "SSRF blocked: {host} resolves to private/reserved IP {}",
                socket_addr.ip()
            )));
        }
    }

    Ok(())
}

/// Check if an IP address is in a private/reserved/link-local range.
fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()           // 127.0.0.0/8
                || v4.is_private()     // 10/8, 172.16/12, 192.168/16
                || v4.is_link_local()  // 169.254.0.0/16 (cloud metadata!)
                || v4.is_unspecified() // 0.0.0.0
                || v4.is_broadcast()   // 255.255.255.255
                || v4.is_documentation() // 192.0.2.0/24, 198.51.100.0/24, 203.0.113.0/24
                || v4.octets()[0] == 100 && (v4.octets()[1] & 0xC0) == 64 // 100.64.0.0/10 (CGN)
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()       // ::1
                || v6.is_unspecified() // ::
                // fe80::/10 (link-local)
                || (v6.segments()[0] & 0xFFC0) == 0xFE80
                // fc00::/7 (unique local)
                || (v6.segments()[0] & 0xFE00) == 0xFC00
                // IPv4-mapped IPv6 (::ffff:x.x.x.x)
                || match v6.to_ipv4_mapped() {
                    Some(v4) => is_private_ip(IpAddr::V4(v4)),
                    None => false,
                }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::error::ErrorKind;
    use harvester_core::proxy::{ProxyCredentials, ProxyProtocol};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Picks the status line and extra headers for one request head.
    type Route = Arc<dyn Fn(&str) -> (String, String) + Send + Sync>;

    /// Serves one response per connection, chosen by `route`, and echoes
    /// the request head back in the body.
    async fn serve_with(route: Route) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let route = Arc::clone(&route);
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 8192];
                    let mut read = 0;
                    loop {
                        let n = socket.read(&mut buf[read..]).await.unwrap_or(0);
                        if n == 0 {
                            break;
                        }
                        read += n;
                        if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    let head = String::from_utf8_lossy(&buf[..read]).to_string();
                    let (status_line, extra_headers) = route(&head);
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\n{extra_headers}Content-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{head}",
                        head.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                });
            }
        });
        format!("http://{addr}")
    }

    async fn serve(status_line: &'static str, extra_headers: &'static str) -> String {
        serve_with(Arc::new(move |_: &str| {
            (status_line.to_string(), extra_headers.to_string())
        }))
        .await
    }

    fn context() -> HttpContext {
        HttpContext::new(Arc::new(HttpEngineConfig::default().allow_private_urls()))
    }

    fn cookie<'a>(page: &'a PageSnapshot, name: &str) -> &'a Cookie {
        page.cookies
            .iter()
            .find(|c| c.name == name)
            .unwrap_or_else(|| panic!("cookie {name} missing from {:?}", page.cookies))
    }

    fn request(url: &str) -> NavigationRequest {
        NavigationRequest::new(url, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_navigate_sends_identity_and_collects_cookies() {
        let base = serve(
            "200 OK",
            "Set-Cookie: sid=abc123; Path=/; HttpOnly\r\nSet-Cookie: pref=dark; Max-Age=3600\r\n",
        )
        .await;
        let url = format!("{base}/account/home");

        let mut req = request(&url);
        req.user_agent = Some("TestAgent/2.0".into());
        req.cookies = vec![Cookie::new("returning", "yes")];

        let mut ctx = context();
        let page = ctx.navigate(&req).await.unwrap();

        assert_eq!(page.status, Some(200));
        assert_eq!(page.final_url, url);
        let head = page.content.to_ascii_lowercase();
        assert!(head.contains("user-agent: testagent/2.0"), "{head}");
        assert!(head.contains("cookie: returning=yes"), "{head}");

        let sid = cookie(&page, "sid");
        assert!(sid.http_only);
        assert_eq!(sid.domain.as_deref(), Some("127.0.0.1"));
        assert_eq!(sid.path.as_deref(), Some("/"));
        let pref = cookie(&page, "pref");
        assert_eq!(pref.path.as_deref(), Some("/account"));
        assert!(pref.expires.is_some());
        assert_eq!(cookie(&page, "returning").value, "yes");
        assert!(ctx.is_usable());
    }

    #[tokio::test]
    async fn test_cookies_set_on_redirect_hops_are_kept() {
        let base = serve_with(Arc::new(|head: &str| {
            if head.starts_with("GET /start") {
                (
                    "302 Found".to_string(),
                    "Location: /final\r\nSet-Cookie: cf_clearance=tok; Path=/\r\n".to_string(),
                )
            } else {
                ("200 OK".to_string(), String::new())
            }
        }))
        .await;

        let mut ctx = context();
        let page = ctx.navigate(&request(&format!("{base}/start"))).await.unwrap();

        assert_eq!(page.final_url, format!("{base}/final"));
        assert_eq!(cookie(&page, "cf_clearance").value, "tok");
        // The clearance cookie is replayed on the follow-up hop.
        let head = page.content.to_ascii_lowercase();
        assert!(head.contains("cookie: cf_clearance=tok"), "{head}");
    }

    #[tokio::test]
    async fn test_netscape_expires_keeps_cookie_persistent() {
        let base = serve(
            "200 OK",
            "Set-Cookie: a=1; Path=/; Expires=Wed, 21-Oct-2037 07:28:00 GMT\r\n",
        )
        .await;
        let page = context().navigate(&request(&base)).await.unwrap();
        assert_eq!(cookie(&page, "a").expires, Some(2139722880.0));
    }

    #[tokio::test]
    async fn test_jar_is_reseeded_per_navigation() {
        let base = serve("200 OK", "Set-Cookie: visit=1; Path=/\r\n").await;
        let mut ctx = context();
        ctx.navigate(&request(&base)).await.unwrap();

        // A navigation for a fresh session must not replay the old jar.
        let page = ctx.navigate(&request(&base)).await.unwrap();
        let head = page.content.to_ascii_lowercase();
        assert!(!head.contains("cookie:"), "{head}");
    }

    #[tokio::test]
    async fn test_throttle_status_is_returned_for_classification() {
        let base = serve("429 Too Many Requests", "").await;
        let page = context().navigate(&request(&base)).await.unwrap();
        assert_eq!(page.status, Some(429));
    }

    #[tokio::test]
    async fn test_server_error_maps_to_network() {
        let base = serve("503 Service Unavailable", "").await;
        let err = context().navigate(&request(&base)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }

    #[tokio::test]
    async fn test_connection_refused_marks_context_unusable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut ctx = context();
        let err = ctx.navigate(&request(&format!("http://{addr}/"))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(!ctx.is_usable());
    }

    #[tokio::test]
    async fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let mut req = request(&format!("http://{addr}/"));
        req.timeout = Duration::from_millis(200);
        let err = context().navigate(&req).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[tokio::test]
    async fn test_requests_go_through_selected_proxy() {
        let proxy_url = serve("200 OK", "").await;
        let proxy_addr: std::net::SocketAddr = proxy_url
            .trim_start_matches("http://")
            .parse()
            .unwrap();

        let mut req = request("http://shop.invalid/catalog");
        req.proxy = Some(Proxy {
            id: "p1".into(),
            host: proxy_addr.ip().to_string(),
            port: proxy_addr.port(),
            protocol: ProxyProtocol::Http,
            credentials: Some(ProxyCredentials {
                username: "user".into(),
                password: "pass".into(),
            }),
        });

        let mut ctx = HttpContext::new(Arc::new(HttpEngineConfig::default()));
        let page = ctx.navigate(&req).await.unwrap();
        let head = page.content.to_ascii_lowercase();
        assert!(head.starts_with("get http://shop.invalid/catalog"), "{head}");
        // base64("user:pass")
        assert!(head.contains("proxy-authorization: basic dxnlcjpwyxnz"), "{head}");
    }

    fn request_cookies(jar: &SessionJar, url: &str) -> Vec<String> {
        let url = Url::parse(url).unwrap();
        let mut pairs: Vec<String> = reqwest::cookie::CookieStore::cookies(jar, &url)
            .map(|v| {
                v.to_str()
                    .unwrap()
                    .split("; ")
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        pairs.sort();
        pairs
    }

    #[test]
    fn test_seeded_cookies_are_scoped() {
        let target = Url::parse("https://www.shop.example.com/cart/items").unwrap();
        let mut scoped = Cookie::new("a", "1");
        scoped.domain = Some("shop.example.com".into());
        scoped.path = Some("/cart".into());
        let mut other_host = Cookie::new("b", "2");
        other_host.domain = Some("elsewhere.com".into());
        let mut other_path = Cookie::new("c", "3");
        other_path.path = Some("/cartography".into());
        let mut expired = Cookie::new("d", "4");
        expired.expires = Some(1.0);
        let anywhere = Cookie::new("e", "5");

        let jar = SessionJar::default();
        jar.seed(&[scoped, other_host, other_path, expired, anywhere], &target);
        assert_eq!(request_cookies(&jar, target.as_str()), vec!["a=1", "e=5"]);

        let mut secure = Cookie::new("s", "1");
        secure.secure = true;
        secure.domain = Some("shop.example.com".into());
        jar.seed(&[secure], &target);
        assert!(request_cookies(&jar, "http://shop.example.com/").is_empty());
        assert_eq!(request_cookies(&jar, "https://shop.example.com/"), vec!["s=1"]);
    }

    #[test]
    fn test_exported_cookie_attributes() {
        let jar = SessionJar::default();
        let url = Url::parse("https://shop.example.com/a/b").unwrap();
        reqwest::cookie::CookieStore::set_cookies(
            &jar,
            &mut [HeaderValue::from_static(
                "token=xyz; Domain=example.com; Path=/; Expires=Wed, 21 Oct 2037 07:28:00 GMT; Secure",
            )]
            .iter(),
            &url,
        );

        let cookies = jar.export();
        assert_eq!(cookies.len(), 1);
        let token = &cookies[0];
        assert_eq!(token.value, "xyz");
        assert_eq!(token.domain.as_deref(), Some("example.com"));
        assert_eq!(token.path.as_deref(), Some("/"));
        assert_eq!(token.expires, Some(2139722880.0));
        assert!(token.secure);
        assert!(!token.http_only);
    }

    #[test]
    fn test_private_ipv4() {
        assert!(is_private_ip("127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("10.0.0.1".parse().unwrap()));
        assert!(is_private_ip("172.16.0.1".parse().unwrap()));
        assert!(is_private_ip("192.168.1.1".parse().unwrap()));
        assert!(is_private_ip("169.254.169.254".parse().unwrap())); // cloud metadata
        assert!(is_private_ip("0.0.0.0".parse().unwrap()));
        assert!(is_private_ip("100.64.0.1".parse().unwrap())); // CGN
    }

    #[test]
    fn test_public_ipv4() {
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(!is_private_ip("1.1.1.1".parse().unwrap()));
        assert!(!is_private_ip("93.184.216.34".parse().unwrap()));
    }

    #[test]
    fn test_private_ipv6() {
        assert!(is_private_ip("::1".parse().unwrap()));
        assert!(is_private_ip("::".parse().unwrap()));
        assert!(is_private_ip("fe80::1".parse().unwrap()));
        assert!(is_private_ip("fc00::1".parse().unwrap()));
        assert!(is_private_ip("::ffff:127.0.0.1".parse().unwrap()));
        assert!(is_private_ip("::ffff:169.254.169.254".parse().unwrap()));
    }

    #[test]
    fn test_public_ipv6() {
        assert!(!is_private_ip("2001:4860:4860::8888".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_private_ip() {
        let err = validate_url("http://127.0.0.1/admin").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_metadata_ip() {
        let err = validate_url("http://169.254.169.254/latest/meta-data/")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("SSRF blocked"));
    }

    #[tokio::test]
    async fn test_validate_url_rejects_bad_scheme() {
        let err = validate_url("file:///etc/passwd").await.unwrap_err();
        assert!(err.to_string().contains("not allowed"));
    }

    #[tokio::test]
    async fn test_ssrf_guard_applies_to_direct_navigation() {
        let mut ctx = HttpContext::new(Arc::new(HttpEngineConfig::default()));
        let err = ctx.navigate(&request("http://[::1]:9/")).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(ctx.is_usable());
    }
}
