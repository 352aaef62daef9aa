use crate::error::TunnelError;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE, COOKIE};
use http::{HeaderMap, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use url::Url;

/// Whether 3xx responses are followed or handed back as-is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RedirectMode {
    #[default]
    Follow,
    Manual,
}

#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub redirect: RedirectMode,
}

impl Request {
    pub fn new(method: Method, url: &str) -> Result<Self, TunnelError> {
        let url = Url::parse(url)
            .map_err(|e| TunnelError::InvalidRequest(format!("invalid URL {url}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TunnelError::InvalidRequest(format!(
                "unsupported scheme {}",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(TunnelError::InvalidRequest(format!("{url} has no host")));
        }
        Ok(Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            redirect: RedirectMode::Follow,
        })
    }

    pub fn get(url: &str) -> Result<Self, TunnelError> {
        Self::new(Method::GET, url)
    }

    /// Append a header value. Repeated names keep every value.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, TunnelError> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TunnelError::InvalidRequest(format!("invalid header name {name}: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| TunnelError::InvalidRequest(format!("invalid value for {name}: {e}")))?;
        self.headers.append(name, value);
        Ok(self)
    }

    /// Append one `name=value` pair to the cookie header values.
    pub fn cookie(self, name: &str, value: &str) -> Result<Self, TunnelError> {
        self.header(COOKIE.as_str(), &format!("{name}={value}"))
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn redirect(mut self, mode: RedirectMode) -> Self {
        self.redirect = mode;
        self
    }
}

#[derive(Debug, Clone)]
pub struct Response {
    status: StatusCode,
    url: Url,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn new(status: StatusCode, url: Url, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            url,
            headers,
            body,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn ok(&self) -> bool {
        self.status.is_success()
    }

    /// Final URL after redirects.
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if it is valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn header_all(&self, name: &str) -> Vec<&str> {
        self.headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect()
    }

    /// Every header with all of its values, `set-cookie` included.
    pub fn raw_headers(&self) -> BTreeMap<String, Vec<String>> {
        let mut raw: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &self.headers {
            raw.entry(name.as_str().to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        raw
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok())
    }

    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }

    /// Inline the body as a `data:` URL.
    pub fn to_data_url(&self) -> String {
        let mime = self
            .content_type()
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or("application/octet-stream");
        format!("data:{mime};base64,{}", STANDARD.encode(&self.body))
    }
}
