use std::sync::Arc;

use tracing::debug;

use crate::config::ClientConfig;
use crate::errors::StreamError;
use crate::request::GenerateRequest;
use crate::session::{AbortHandle, EventSink, SessionOutcome, StreamRequest, StreamSession};
use crate::transport::{HttpTransport, Transport};
use crate::turn::TurnStream;

pub(crate) struct ClientInner {
    config: ClientConfig,
    transport: Arc<dyn Transport>,
}

/// Entry point for streaming generations from the service.
///
/// Cheap to clone; clones share the HTTP connection pool.
#[derive(Clone)]
pub struct ChatClient {
    inner: Arc<ClientInner>,
}

impl ChatClient {
    /// Starts a builder for configuring a `ChatClient`.
    pub fn builder() -> ChatClientBuilder {
        ChatClientBuilder::default()
    }

    /// Builds a client with the HTTP transport from `CHAT_STREAM_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, StreamError> {
        Self::builder().config(ClientConfig::from_env()?).build()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Prepares a session for `request` without starting it.
    ///
    /// The session honours `abort` for its whole lifetime, including retry
    /// delays.
    pub fn session(
        &self,
        request: &GenerateRequest,
        abort: &AbortHandle,
    ) -> Result<StreamSession, StreamError> {
        let payload = request.to_payload()?;
        let config = &self.inner.config;
        Ok(StreamSession::new(
            self.inner.transport.clone(),
            StreamRequest {
                url: config.stream_url(),
                payload,
            },
            config.retry_policy(),
            abort,
        )
        .with_idle_timeout(config.idle_timeout))
    }

    /// Streams `request` into `sink` on the current task.
    pub async fn stream<S>(
        &self,
        request: &GenerateRequest,
        sink: &mut S,
        abort: &AbortHandle,
    ) -> Result<SessionOutcome, StreamError>
    where
        S: EventSink + ?Sized,
    {
        let mut session = self.session(request, abort)?;
        session.run(sink).await
    }

    /// Starts `request` as a background turn with its own accumulator.
    ///
    /// Request validation errors are returned here; everything after that is
    /// reported through the returned stream.
    pub fn start_turn(&self, request: &GenerateRequest) -> Result<TurnStream, StreamError> {
        let abort = AbortHandle::new();
        let session = self.session(request, &abort)?;
        debug!(model = %request.model, "starting turn");
        Ok(TurnStream::spawn(session, abort))
    }

    /// Fetches the service health document.
    pub async fn health(&self) -> Result<serde_json::Value, StreamError> {
        self.inner
            .transport
            .health(&self.inner.config.health_url())
            .await
    }
}

/// Builder used to configure a `ChatClient`.
#[derive(Default)]
pub struct ChatClientBuilder {
    config: Option<ClientConfig>,
    transport: Option<Arc<dyn Transport>>,
}

impl ChatClientBuilder {
    /// Sets the connection and retry settings (default: `ClientConfig::default()`).
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replaces the HTTP transport, e.g. with an in-memory fake.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Validates the config and builds the client.
    pub fn build(self) -> Result<ChatClient, StreamError> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        let transport = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(&config)?),
        };
        Ok(ChatClient {
            inner: Arc::new(ClientInner { config, transport }),
        })
    }
}
