//! Authenticated JSON-over-HTTP client shared by the REST backing systems
//!
//! Every request fetches a fresh token from the [`TokenProvider`]. Transport
//! failures map to [`Error::RemoteUnavailable`]; non-success statuses are
//! classified with [`Error::from_status`] so callers can recover 404/409.

use std::sync::Arc;

use reqwest::Method;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::credentials::{BackingSystem, TokenProvider};
use crate::{Error, Result};

/// How the token is presented to the remote end
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthScheme {
    /// `Authorization: Bearer <token>`
    Bearer,
    /// `X-Vault-Token: <token>`
    VaultToken,
}

/// Raw response from a backing system
#[derive(Debug)]
pub struct RestResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl RestResponse {
    /// 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Client for one backing system's REST API
#[derive(Clone)]
pub struct RestClient {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    system: BackingSystem,
    base_url: String,
    scheme: AuthScheme,
}

impl RestClient {
    /// Create a client rooted at `base_url`
    pub fn new(
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
        system: BackingSystem,
        base_url: impl Into<String>,
        scheme: AuthScheme,
    ) -> Self {
        Self {
            http,
            tokens,
            system,
            base_url: base_url.into(),
            scheme,
        }
    }

    /// Backing system this client talks to
    pub fn system(&self) -> BackingSystem {
        self.system
    }

    fn url(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    /// Send a request and return the response whatever its status
    pub async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        let token = self.tokens.token(self.system).await?;
        let url = self.url(path);
        trace!(system = %self.system, %method, %url, "sending request");

        let mut request = self.http.request(method.clone(), &url);
        request = match self.scheme {
            AuthScheme::Bearer => request.bearer_auth(&token),
            AuthScheme::VaultToken => request.header("X-Vault-Token", &token),
        };
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            Error::unavailable(self.system.as_str(), format!("{method} {url}: {e}"))
        })?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            Error::unavailable(self.system.as_str(), format!("{method} {url}: {e}"))
        })?;

        Ok(RestResponse { status, body })
    }

    /// Send a request and fail on any non-success status
    pub async fn expect_success(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<RestResponse> {
        let response = self.send(method.clone(), path, body).await?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(self.error_for(&method, path, &response))
        }
    }

    /// GET a JSON document; 404 reads as absent
    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let response = self.send(Method::GET, path, None).await?;
        match response.status {
            404 => Ok(None),
            _ if response.is_success() => response.json().map(Some),
            _ => Err(self.error_for(&Method::GET, path, &response)),
        }
    }

    /// Build the error for a failed response
    pub fn error_for(&self, method: &Method, path: &str, response: &RestResponse) -> Error {
        Error::from_status(
            self.system.as_str(),
            response.status,
            format!("{method} {path}: {}", response.body.trim()),
        )
    }
}
