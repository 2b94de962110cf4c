use std::time::Duration;

/// Errors raised by the streaming client.
///
/// Application-level failures reported by the service through an `error`
/// event are not represented here; they travel as events and end up in the
/// accumulator's `Errored` phase.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Invalid client configuration.
    #[error("config error: {0}")]
    Config(String),
    /// Invalid request built by the caller.
    #[error("validation error: {0}")]
    Validation(String),
    /// The service answered with a non-success HTTP status.
    #[error("stream request failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// The service answered successfully but sent no body to read.
    #[error("stream response has no body")]
    NoBody,
    /// Network failure while connecting or reading the body.
    #[error("transport error: {0}")]
    Transport(String),
    /// No bytes arrived within the configured idle window.
    #[error("no data received for {0:?}")]
    IdleTimeout(Duration),
    /// Transport failures persisted through every allowed attempt.
    #[error("stream failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
    /// Internal invariant violation (for example a dropped task channel).
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl StreamError {
    /// Creates a transport error from any displayable cause.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub(crate) fn protocol_msg(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Returns `true` when the session controller may restart the request.
    ///
    /// HTTP status failures and empty bodies are answers from the service,
    /// so only connection-level failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::IdleTimeout(_))
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(value: reqwest::Error) -> Self {
        StreamError::Transport(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connection_failures_are_retryable() {
        assert!(StreamError::transport("reset by peer").is_retryable());
        assert!(StreamError::IdleTimeout(Duration::from_secs(5)).is_retryable());
        assert!(
            !StreamError::Status {
                status: 503,
                body: "busy".into()
            }
            .is_retryable()
        );
        assert!(!StreamError::NoBody.is_retryable());
        assert!(
            !StreamError::RetriesExhausted {
                attempts: 3,
                last: "x".into()
            }
            .is_retryable()
        );
    }

    #[test]
    fn status_error_message_names_the_status() {
        let err = StreamError::Status {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(
            err.to_string(),
            "stream request failed with status 502: bad gateway"
        );
    }
}
