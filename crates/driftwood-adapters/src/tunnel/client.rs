use super::message::{RedirectMode, Request, Response};
use crate::engine::TlsEngine;
use crate::error::TunnelError;
use crate::wisp::{CloseReason, Multiplexor};
use bytes::Bytes;
use http::header::{
    HeaderName, HeaderValue, AUTHORIZATION, CONTENT_LENGTH, COOKIE, HOST, LOCATION,
    PROXY_AUTHORIZATION, TRANSFER_ENCODING, USER_AGENT as USER_AGENT_HEADER, WWW_AUTHENTICATE,
};
use http::{HeaderMap, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace};
use url::Url;

pub const USER_AGENT: &str = concat!("driftwood/", env!("CARGO_PKG_VERSION"));
pub const MAX_REDIRECTS: usize = 10;
/// Headers that never follow a redirect to another origin.
const CROSS_ORIGIN_STRIPPED: [HeaderName; 5] =
    [AUTHORIZATION, COOKIE, PROXY_AUTHORIZATION, WWW_AUTHENTICATE, HOST];
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelClientConfig {
    pub wisp_url: String,
    pub user_agent: String,
    /// Only `false` is supported; the UDP extension is never negotiated.
    pub udp_extension_required: bool,
    /// Bound on the WebSocket handshake. Tunneled requests are unbounded.
    pub connect_timeout: Duration,
}

impl TunnelClientConfig {
    pub fn new(wisp_url: impl Into<String>) -> Self {
        Self {
            wisp_url: wisp_url.into(),
            user_agent: USER_AGENT.to_string(),
            udp_extension_required: false,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
        }
    }
}

/// Something that can carry a [`Request`] to its destination.
pub trait Transport: Send + Sync {
    /// Wisp server this transport is bound to.
    fn url(&self) -> &str;

    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TunnelError>>;

    /// Drop the current connection so the next request opens a fresh one.
    fn replace_stream_provider(&self);
}

/// Builds transports. Construction is synchronous; connecting happens on
/// first use.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        config: TunnelClientConfig,
        engine: Arc<TlsEngine>,
    ) -> Result<Arc<dyn Transport>, TunnelError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WispConnector;

impl Connector for WispConnector {
    fn connect(
        &self,
        config: TunnelClientConfig,
        engine: Arc<TlsEngine>,
    ) -> Result<Arc<dyn Transport>, TunnelError> {
        Ok(Arc::new(TunnelClient::new(config, engine)?))
    }
}

/// HTTP(S) client whose TCP connections are Wisp streams.
pub struct TunnelClient {
    config: TunnelClientConfig,
    engine: Arc<TlsEngine>,
    provider: Mutex<Option<Arc<Multiplexor>>>,
    connect_gate: tokio::sync::Mutex<()>,
}

impl TunnelClient {
    pub fn new(config: TunnelClientConfig, engine: Arc<TlsEngine>) -> Result<Self, TunnelError> {
        if config.udp_extension_required {
            return Err(TunnelError::Config(
                "the Wisp UDP extension is not supported".to_string(),
            ));
        }
        let url = Url::parse(&config.wisp_url).map_err(|e| {
            TunnelError::Config(format!("invalid Wisp server URL {}: {e}", config.wisp_url))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TunnelError::Config(format!(
                "Wisp server URL must be ws:// or wss://, got {}",
                config.wisp_url
            )));
        }
        Ok(Self {
            config,
            engine,
            provider: Mutex::new(None),
            connect_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &TunnelClientConfig {
        &self.config
    }

    fn current_provider(&self) -> Option<Arc<Multiplexor>> {
        self.provider
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|mux| mux.close_reason().is_none())
            .cloned()
    }

    /// The live connection, opening one if needed. Concurrent callers share
    /// a single connection attempt.
    async fn stream_provider(&self) -> Result<Arc<Multiplexor>, TunnelError> {
        if let Some(mux) = self.current_provider() {
            return Ok(mux);
        }
        let _gate = self.connect_gate.lock().await;
        if let Some(mux) = self.current_provider() {
            return Ok(mux);
        }

        let mux = Multiplexor::connect(
            &self.config.wisp_url,
            &self.config.user_agent,
            self.config.connect_timeout,
            self.engine.client_config(),
        )
        .await?;
        *self.provider.lock().unwrap_or_else(|e| e.into_inner()) = Some(mux.clone());
        Ok(mux)
    }

    async fn execute(&self, request: &Request) -> Result<Response, TunnelError> {
        let mut method = request.method.clone();
        let mut url = request.url.clone();
        let mut headers = request.headers.clone();
        let mut body = request.body.clone();
        let mut redirects = 0;

        loop {
            let response = self
                .send_once(&method, &url, &headers, body.clone())
                .await?;
            if request.redirect == RedirectMode::Manual {
                return Ok(response);
            }
            let status = response.status();
            let Some(location) = redirect_target(status, &response) else {
                return Ok(response);
            };
            if redirects >= MAX_REDIRECTS {
                return Err(TunnelError::TooManyRedirects(MAX_REDIRECTS));
            }
            redirects += 1;

            let next = url.join(&location).map_err(|e| {
                TunnelError::Transport(format!("invalid redirect location {location}: {e}"))
            })?;
            if next.origin() != url.origin() {
                strip_cross_origin_headers(&mut headers);
            }
            url = next;
            if matches!(status.as_u16(), 301..=303) && method != Method::HEAD {
                method = Method::GET;
                body = None;
            }
            trace!(%url, status = status.as_u16(), "following redirect");
        }
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<Bytes>,
    ) -> Result<Response, TunnelError> {
        let host = url
            .host_str()
            .ok_or_else(|| TunnelError::InvalidRequest(format!("{url} has no host")))?
            .to_string();
        let https = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(TunnelError::InvalidRequest(format!(
                    "unsupported scheme {other}"
                )))
            }
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });
        let request = build_request(method, url, headers, body, &self.config.user_agent)?;

        let mux = self.stream_provider().await?;
        let stream = mux.open_tcp(&host, port)?;
        let handle = stream.handle();

        let result = if https {
            let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                TunnelError::InvalidRequest(format!("invalid TLS server name {host}: {e}"))
            })?;
            match self.engine.connector().connect(server_name, stream).await {
                Ok(tls) => round_trip(tls, request).await,
                Err(err) => Err(TunnelError::Transport(format!(
                    "TLS handshake with {host} failed: {err}"
                ))),
            }
        } else {
            round_trip(stream, request).await
        };

        // A stream the server closed explains the failure better than the
        // HTTP layer's view of it.
        let abnormal_close = || {
            handle
                .close_reason()
                .filter(|reason| *reason != CloseReason::Voluntary)
        };
        let (status, headers, body) = result.map_err(|err| match abnormal_close() {
            Some(reason) => TunnelError::from(reason),
            None => err,
        })?;
        // Without framing, EOF ends the body, so an aborted stream would
        // otherwise pass for a complete response.
        if ends_at_close(method, status, &headers) {
            if let Some(reason) = abnormal_close() {
                debug!(%url, %reason, "close-delimited body cut short");
                return Err(TunnelError::from(reason));
            }
        }
        Ok(Response::new(status, url.clone(), headers, body))
    }
}

impl Transport for TunnelClient {
    fn url(&self) -> &str {
        &self.config.wisp_url
    }

    fn fetch<'a>(&'a self, request: &'a Request) -> BoxFuture<'a, Result<Response, TunnelError>> {
        Box::pin(self.execute(request))
    }

    fn replace_stream_provider(&self) {
        let previous = self
            .provider
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if previous.is_some() {
            debug!(url = %self.config.wisp_url, "replaced wisp stream provider");
        }
    }
}

fn redirect_target(status: StatusCode, response: &Response) -> Option<String> {
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return None;
    }
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn strip_cross_origin_headers(headers: &mut HeaderMap) {
    for name in &CROSS_ORIGIN_STRIPPED {
        headers.remove(name);
    }
}

/// Whether the response body is delimited only by the connection closing.
fn ends_at_close(method: &Method, status: StatusCode, headers: &HeaderMap) -> bool {
    if method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return false;
    }
    !headers.contains_key(CONTENT_LENGTH) && !headers.contains_key(TRANSFER_ENCODING)
}

/// Origin-form request with `host`, a user agent and one coalesced `cookie`
/// line.
fn build_request(
    method: &Method,
    url: &Url,
    headers: &HeaderMap,
    body: Option<Bytes>,
    user_agent: &str,
) -> Result<http::Request<Full<Bytes>>, TunnelError> {
    let mut target = url.path().to_string();
    if let Some(query) = url.query() {
        target.push('?');
        target.push_str(query);
    }

    let mut wire = HeaderMap::with_capacity(headers.len() + 2);
    for (name, value) in headers {
        if name != COOKIE {
            wire.append(name.clone(), value.clone());
        }
    }
    if let Some(cookie) = coalesce_cookies(headers)? {
        wire.insert(COOKIE, cookie);
    }
    if !wire.contains_key(HOST) {
        wire.insert(HOST, host_header(url)?);
    }
    if !wire.contains_key(USER_AGENT_HEADER) {
        let agent = HeaderValue::from_str(user_agent)
            .map_err(|e| TunnelError::Config(format!("invalid user agent: {e}")))?;
        wire.insert(USER_AGENT_HEADER, agent);
    }

    let mut request = http::Request::builder()
        .method(method.clone())
        .uri(target)
        .body(Full::new(body.unwrap_or_default()))
        .map_err(|e| TunnelError::InvalidRequest(e.to_string()))?;
    *request.headers_mut() = wire;
    Ok(request)
}

fn coalesce_cookies(headers: &HeaderMap) -> Result<Option<HeaderValue>, TunnelError> {
    let values: Vec<&str> = headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .collect();
    if values.is_empty() {
        return Ok(None);
    }
    HeaderValue::from_str(&values.join("; "))
        .map(Some)
        .map_err(|e| TunnelError::InvalidRequest(format!("invalid cookie header: {e}")))
}

fn host_header(url: &Url) -> Result<HeaderValue, TunnelError> {
    let host = url.host_str().unwrap_or_default();
    let value = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    HeaderValue::from_str(&value)
        .map_err(|e| TunnelError::InvalidRequest(format!("invalid host {value}: {e}")))
}

async fn round_trip<S>(
    io: S,
    request: http::Request<Full<Bytes>>,
) -> Result<(StatusCode, HeaderMap, Bytes), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(io))
        .await
        .map_err(TunnelError::transport)?;
    let driver = tokio::spawn(async move {
        if let Err(err) = connection.await {
            trace!("tunneled connection ended: {err}");
        }
    });

    let result = async {
        let response = sender
            .send_request(request)
            .await
            .map_err(TunnelError::transport)?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(TunnelError::transport)?
            .to_bytes();
        Ok::<_, TunnelError>((parts.status, parts.headers, body))
    }
    .await;

    driver.abort();
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::TlsEngine;

    fn engine() -> Arc<TlsEngine> {
        Arc::new(TlsEngine::from_pem(crate::engine::tests::TEST_ROOT).unwrap())
    }

    #[test]
    fn test_udp_extension_is_rejected() {
        let mut config = TunnelClientConfig::new("wss://wisp.test/");
        config.udp_extension_required = true;
        let err = TunnelClient::new(config, engine()).err().unwrap();
        assert_eq!(err.kind(), crate::ErrorKind::Config);
    }

    #[test]
    fn test_non_websocket_url_is_rejected() {
        let config = TunnelClientConfig::new("https://wisp.test/");
        assert!(TunnelClient::new(config, engine()).is_err());
    }

    #[test]
    fn test_default_config() {
        let config = TunnelClientConfig::new("wss://wisp.test/");
        assert!(config.user_agent.starts_with("driftwood/"));
        assert!(!config.udp_extension_required);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_cookies_are_coalesced_into_one_line() {
        let request = Request::get("https://example.test/api?x=1")
            .unwrap()
            .cookie("a", "1")
            .unwrap()
            .cookie("session", "tok")
            .unwrap();
        let built = build_request(
            &request.method,
            &request.url,
            &request.headers,
            None,
            USER_AGENT,
        )
        .unwrap();

        assert_eq!(built.uri(), "/api?x=1");
        let cookies: Vec<_> = built.headers().get_all(COOKIE).iter().collect();
        assert_eq!(cookies, vec!["a=1; session=tok"]);
        assert_eq!(built.headers()[HOST], "example.test");
        assert_eq!(built.headers()[USER_AGENT_HEADER], USER_AGENT);
    }

    #[test]
    fn test_host_header_keeps_explicit_port() {
        let url = Url::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "127.0.0.1:8080");
        let url = Url::parse("https://example.test:443/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.test");
    }

    #[test]
    fn test_cross_origin_strip_drops_credentials_only() {
        let request = Request::get("https://a.test/")
            .unwrap()
            .cookie("session", "tok")
            .unwrap()
            .header("authorization", "Bearer x")
            .unwrap()
            .header("host", "a.test")
            .unwrap()
            .header("accept", "text/html")
            .unwrap();
        let mut headers = request.headers.clone();
        strip_cross_origin_headers(&mut headers);

        assert!(!headers.contains_key(COOKIE));
        assert!(!headers.contains_key(AUTHORIZATION));
        assert!(!headers.contains_key(HOST));
        assert_eq!(headers["accept"], "text/html");
    }

    #[test]
    fn test_ends_at_close_only_without_framing() {
        let mut framed = HeaderMap::new();
        framed.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        let mut chunked = HeaderMap::new();
        chunked.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        let bare = HeaderMap::new();

        assert!(!ends_at_close(&Method::GET, StatusCode::OK, &framed));
        assert!(!ends_at_close(&Method::GET, StatusCode::OK, &chunked));
        assert!(ends_at_close(&Method::GET, StatusCode::OK, &bare));
        assert!(!ends_at_close(&Method::HEAD, StatusCode::OK, &bare));
        assert!(!ends_at_close(&Method::GET, StatusCode::NO_CONTENT, &bare));
    }

    #[test]
    fn test_redirect_target_only_for_redirect_statuses() {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static("/next"));
        let url = Url::parse("https://example.test/").unwrap();

        let found = Response::new(StatusCode::FOUND, url.clone(), headers.clone(), Bytes::new());
        assert_eq!(redirect_target(found.status(), &found).as_deref(), Some("/next"));

        let not_modified = Response::new(StatusCode::NOT_MODIFIED, url, headers, Bytes::new());
        assert_eq!(redirect_target(not_modified.status(), &not_modified), None);
    }
}
