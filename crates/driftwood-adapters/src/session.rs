//! Cookie-authenticated access to the Shipwrecked API.

use crate::error::TunnelError;
use crate::settings::SharedSettings;
use crate::tunnel::{RedirectMode, Request, Response, TunnelManager};
use anyhow::{Context, Result};
use driftwood_core::{Project, User};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};

pub const TOKEN_COOKIE: &str = "__Secure-next-auth.session-token";
pub const SHIPWRECKED_URL: &str = "https://shipwrecked.hackclub.com";

pub struct Session {
    tunnel: Arc<TunnelManager>,
    base_url: String,
}

impl Session {
    pub fn new(tunnel: Arc<TunnelManager>) -> Self {
        Self {
            tunnel,
            base_url: SHIPWRECKED_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn settings(&self) -> &SharedSettings {
        self.tunnel.settings()
    }

    pub fn tunnel(&self) -> &Arc<TunnelManager> {
        &self.tunnel
    }

    pub fn token(&self) -> Option<String> {
        self.settings().token()
    }

    pub fn logout(&self) -> Result<()> {
        self.settings().update(|s| s.token = None)
    }

    fn api(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Fetch with the session cookie appended. Without a stored token the
    /// request goes out unauthenticated.
    pub async fn fetch_cookie(&self, mut request: Request) -> Result<Response, TunnelError> {
        if let Some(token) = self.token() {
            request = request.cookie(TOKEN_COOKIE, &token)?;
        }
        self.tunnel.fetch(request).await
    }

    /// Open a sign-in link without following its redirect and keep the
    /// session cookie it sets. Returns whether a token was stored.
    pub async fn steal_token(&self, url: &str) -> Result<bool> {
        let request = Request::get(url)?.redirect(RedirectMode::Manual);
        let response = self.tunnel.fetch(request).await?;

        let Some(token) = session_token(&response) else {
            debug!(status = response.status().as_u16(), "sign-in link set no session cookie");
            return Ok(false);
        };
        self.settings()
            .update(|s| s.token = Some(token))
            .context("Failed to store session token")?;
        Ok(true)
    }

    /// The signed-in user. A JSON error payload, or JSON without the user
    /// fields, means the token expired: it is cleared and `None` returned.
    /// Server errors and non-JSON bodies are errors and keep the token.
    pub async fn fetch_me(&self) -> Result<Option<User>> {
        if self.token().is_none() {
            return Ok(None);
        }
        let url = self.api("/api/users/me");
        let response = self.fetch_cookie(Request::get(&url)?).await?;
        if response.status().is_server_error() {
            anyhow::bail!("{url} returned {}", response.status());
        }
        let value: serde_json::Value = response
            .json()
            .with_context(|| format!("Unexpected response from {url}"))?;

        match decode_user(value) {
            Some(user) => Ok(Some(user)),
            None => {
                warn!(
                    status = response.status().as_u16(),
                    "session token rejected, signing out"
                );
                self.logout()?;
                Ok(None)
            }
        }
    }

    /// Every project in the public gallery.
    pub async fn fetch_gallery(&self) -> Result<Vec<Project>> {
        self.get_json("/api/gallery").await
    }

    /// The signed-in user's own projects.
    pub async fn fetch_projects(&self) -> Result<Vec<Project>> {
        self.get_json("/api/projects").await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.api(path);
        let response = self.fetch_cookie(Request::get(&url)?).await?;
        if !response.ok() {
            anyhow::bail!("{url} returned {}", response.status());
        }
        response
            .json()
            .with_context(|| format!("Unexpected response shape from {url}"))
    }
}

/// Value of the session cookie among the response's `set-cookie` headers.
fn session_token(response: &Response) -> Option<String> {
    response
        .header_all("set-cookie")
        .into_iter()
        .filter_map(parse_set_cookie)
        .filter(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.to_string())
        .filter(|value| !value.is_empty())
        .last()
}

/// `name=value` before the first `;`.
fn parse_set_cookie(header: &str) -> Option<(&str, &str)> {
    let pair = header.split(';').next()?;
    let (name, value) = pair.split_once('=')?;
    Some((name.trim(), value.trim()))
}

fn decode_user(value: serde_json::Value) -> Option<User> {
    if value.get("error").is_some_and(|e| !e.is_null()) {
        return None;
    }
    serde_json::from_value(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::header::{HeaderValue, SET_COOKIE};
    use http::{HeaderMap, StatusCode};
    use url::Url;

    fn response(headers: HeaderMap, body: &'static str) -> Response {
        Response::new(
            StatusCode::OK,
            Url::parse("https://shipwrecked.hackclub.com/").unwrap(),
            headers,
            Bytes::from_static(body.as_bytes()),
        )
    }

    #[test]
    fn test_parse_set_cookie() {
        assert_eq!(
            parse_set_cookie("a=b; Path=/; HttpOnly"),
            Some(("a", "b"))
        );
        assert_eq!(parse_set_cookie("flag; Secure"), None);
        assert_eq!(parse_set_cookie("k=v=w"), Some(("k", "v=w")));
    }

    #[test]
    fn test_session_token_found_among_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("csrf=xyz; Path=/"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static(
                "__Secure-next-auth.session-token=tok123; Path=/; Secure; HttpOnly",
            ),
        );
        assert_eq!(session_token(&response(headers, "")).as_deref(), Some("tok123"));
    }

    #[test]
    fn test_session_token_missing() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("csrf=xyz; Path=/"));
        assert_eq!(session_token(&response(headers, "")), None);
        assert_eq!(session_token(&response(HeaderMap::new(), "")), None);
    }

    #[test]
    fn test_decode_user_rejects_error_shape() {
        let ok = serde_json::json!({"id": "u1", "name": "Ada", "isAdmin": false});
        assert_eq!(decode_user(ok).unwrap().display_name(), "Ada");

        let expired = serde_json::json!({"error": "Unauthorized"});
        assert!(decode_user(expired).is_none());

        let missing_id = serde_json::json!({"name": "Ada"});
        assert!(decode_user(missing_id).is_none());
    }
}
