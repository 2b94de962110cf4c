//! Client for token-streaming chat completions over Server-Sent Events.
//!
//! A request is POSTed to the generation service, the `text/event-stream`
//! body is decoded into [`StreamEvent`]s, and the events drive a
//! [`ResponseAccumulator`] that builds the visible response. Dropped
//! connections are restarted with linear backoff; an [`AbortHandle`] stops a
//! stream at any point, including during a retry delay.
//!
//! # Streaming a turn
//!
//! ```no_run
//! use chat_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), StreamError> {
//! let client = ChatClient::builder()
//!     .config(ClientConfig::new("http://localhost:8000"))
//!     .build()?;
//!
//! let mut turn = client.start_turn(&GenerateRequest::new("llama3", "Say hello").language("en"))?;
//! while let Some(update) = turn.next_update().await {
//!     if let TurnUpdate::Event(event) = update
//!         && event.kind() == EventKind::Token
//!     {
//!         print!("{}", event.payload::<TokenPayload>().text().unwrap_or_default());
//!     }
//! }
//!
//! let output = turn.finish().await?;
//! println!("\n{} tokens", output.stats.token_count);
//! # Ok(())
//! # }
//! ```

/// Response state machine fed by stream events.
pub mod accumulator;
/// Client entry point and builder.
pub mod client;
/// Connection and retry settings.
pub mod config;
/// Multi-turn chat transcript.
pub mod conversation;
/// Public error type.
pub mod errors;
/// Decoded events and their payload shapes.
pub mod event;
/// Process-wide `tracing` setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Generation request body.
pub mod request;
/// Backoff policy for restarting dropped streams.
pub mod retry;
/// Stream session controller and cancellation handle.
pub mod session;
/// Incremental SSE frame decoder.
pub mod sse;
/// HTTP transport and the trait used to substitute it.
pub mod transport;
/// Background turns with update channels.
pub mod turn;

pub use accumulator::{CodeBlock, Phase, ResponseAccumulator, ResponseSnapshot, StreamStats};
pub use client::{ChatClient, ChatClientBuilder};
pub use config::ClientConfig;
pub use conversation::{ChatMessage, Conversation, Role};
pub use errors::StreamError;
pub use event::{EventData, EventKind, StreamEvent};
pub use observability::init_observability;
pub use request::{Attachments, GenerateRequest, KeepAlive};
pub use retry::{RetryNotice, RetryPolicy};
pub use session::{AbortHandle, EventSink, SessionOutcome, StreamRequest, StreamSession};
pub use sse::{ByteStream, FrameDecoder, decode_stream};
pub use transport::{HttpTransport, Transport};
pub use turn::{TurnHandle, TurnOutput, TurnStream, TurnUpdate};
