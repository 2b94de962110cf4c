use futures::StreamExt as _;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::sse::ByteStream;

/// Opens streaming exchanges with the generation service.
///
/// The session controller owns retries and cancellation; an implementation
/// only performs one request per call.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// POSTs `payload` to `url` and returns the response body as byte chunks.
    ///
    /// Non-success statuses map to `StreamError::Status`, an empty body to
    /// `StreamError::NoBody`, and connection failures to
    /// `StreamError::Transport`.
    async fn open(&self, url: &str, payload: &serde_json::Value)
    -> Result<ByteStream, StreamError>;

    /// Fetches the service health document.
    async fn health(&self, url: &str) -> Result<serde_json::Value, StreamError> {
        Err(StreamError::Config(format!(
            "health checks are not supported by this transport ({url})"
        )))
    }
}

/// `reqwest`-backed transport.
///
/// Cookies set by the service are kept and replayed, and the optional bearer
/// token from the config is attached to every request.
pub struct HttpTransport {
    client: reqwest::Client,
    auth_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &ClientConfig) -> Result<Self, StreamError> {
        // No overall request timeout: a healthy stream may stay open for
        // minutes. Stalls are caught by the session's idle timeout.
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .cookie_store(true)
            .build()
            .map_err(|e| StreamError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            auth_token: config.auth_token.clone().filter(|t| !t.trim().is_empty()),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
    async fn open(
        &self,
        url: &str,
        payload: &serde_json::Value,
    ) -> Result<ByteStream, StreamError> {
        debug!(%url, "opening event stream");
        let request = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .json(payload);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("stream request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        if response.content_length() == Some(0) {
            return Err(StreamError::NoBody);
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !content_type.starts_with("text/event-stream") {
            warn!(%url, content_type, "stream response is not text/event-stream; decoding anyway");
        }

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| StreamError::transport(format!("stream read failed: {e}"))));
        Ok(Box::pin(body))
    }

    async fn health(&self, url: &str) -> Result<serde_json::Value, StreamError> {
        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| StreamError::transport(format!("health request failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StreamError::Status {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json()
            .await
            .map_err(|e| StreamError::protocol_msg(format!("invalid health document: {e}")))
    }
}
