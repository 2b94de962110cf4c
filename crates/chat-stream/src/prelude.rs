//! Common imports for typical client usage.
//!
//! Re-exports the types most callers touch so application code needs fewer
//! import lines.
pub use crate::event::TokenPayload;
pub use crate::{
    AbortHandle, ChatClient, ChatMessage, ClientConfig, Conversation, EventKind, EventSink,
    GenerateRequest, Phase, ResponseAccumulator, SessionOutcome, StreamError, StreamEvent,
    TurnOutput, TurnStream, TurnUpdate,
};
