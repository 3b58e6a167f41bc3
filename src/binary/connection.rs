//! Keep-alive HTTP connection to the engine endpoint.
//!
//! HTTP error statuses are returned as responses; only transport failures
//! become [`EngineError::Network`]. Callers turn error statuses into typed
//! errors with [`Connection::on_http_error`].

use crate::constants::http;
use crate::engine::RequestHeaders;
use crate::error::{EngineError, EngineResult};
use parking_lot::RwLock;
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    /// Header names are lowercase
    pub headers: HashMap<String, String>,
    /// Parsed JSON, or the raw text when the body is not JSON
    pub body: Value,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..400).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
struct OpenConnection {
    client: Client,
    base_url: Url,
}

#[derive(Debug, Default)]
pub struct Connection {
    inner: RwLock<Option<OpenConnection>>,
}

impl Connection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the pool against `url`. Opening an open connection is a no-op.
    pub fn open(&self, url: &str) -> EngineResult<()> {
        let mut inner = self.inner.write();
        if inner.is_some() {
            return Ok(());
        }

        let base_url = Url::parse(url)
            .map_err(|e| EngineError::Configuration(format!("invalid engine url {url}: {e}")))?;
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .build()
            .map_err(|e| EngineError::Configuration(format!("cannot build HTTP client: {e}")))?;

        debug!(url = %base_url, "opened engine connection");
        *inner = Some(OpenConnection { client, base_url });
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.inner.read().is_some()
    }

    pub fn base_url(&self) -> Option<Url> {
        self.inner.read().as_ref().map(|open| open.base_url.clone())
    }

    /// Drop the pool. Safe when never opened.
    pub fn close(&self) {
        if self.inner.write().take().is_some() {
            debug!("closed engine connection");
        }
    }

    fn current(&self) -> EngineResult<OpenConnection> {
        self.inner.read().clone().ok_or(EngineError::NotConnected)
    }

    fn url(open: &OpenConnection, path: &str) -> EngineResult<Url> {
        open.base_url
            .join(path)
            .map_err(|e| EngineError::Configuration(format!("invalid engine path {path}: {e}")))
    }

    pub async fn post(
        &self,
        path: &str,
        body: &Value,
        headers: &RequestHeaders,
    ) -> EngineResult<HttpResponse> {
        let open = self.current()?;
        let mut request = open.client.post(Self::url(&open, path)?).json(body);
        if let Some(transaction_id) = &headers.transaction_id {
            request = request.header(http::TRANSACTION_ID_HEADER, transaction_id);
        }
        if let Some(traceparent) = &headers.traceparent {
            request = request.header(http::TRACEPARENT_HEADER, traceparent);
        }

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::from_transport(&e))?;
        Self::read_response(response).await
    }

    pub async fn get(&self, path: &str) -> EngineResult<HttpResponse> {
        let open = self.current()?;
        let response = open
            .client
            .get(Self::url(&open, path)?)
            .send()
            .await
            .map_err(|e| EngineError::from_transport(&e))?;
        Self::read_response(response).await
    }

    async fn read_response(response: reqwest::Response) -> EngineResult<HttpResponse> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|value| (name.as_str().to_ascii_lowercase(), value.to_string()))
            })
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::from_transport(&e))?;
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }

    /// Pass successful responses through; hand error statuses to `handler`
    pub fn on_http_error<F>(response: HttpResponse, handler: F) -> EngineResult<HttpResponse>
    where
        F: FnOnce(HttpResponse) -> EngineError,
    {
        if response.status >= 400 {
            Err(handler(response))
        } else {
            Ok(response)
        }
    }
}
