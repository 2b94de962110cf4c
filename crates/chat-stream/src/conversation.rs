use crate::client::ChatClient;
use crate::errors::StreamError;
use crate::request::GenerateRequest;
use crate::turn::{TurnHandle, TurnOutput, TurnStream};

#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

/// In-memory transcript of one chat.
///
/// At most one turn is active: `send` cancels the previous turn and waits for
/// it to release its stream before starting the next. History lives only in
/// memory.
pub struct Conversation {
    id: uuid::Uuid,
    client: ChatClient,
    history: Vec<ChatMessage>,
    active: Option<TurnHandle>,
}

impl Conversation {
    pub fn new(client: ChatClient) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            client,
            history: Vec::new(),
            active: None,
        }
    }

    pub fn id(&self) -> uuid::Uuid {
        self.id
    }

    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Starts a new turn for `request`, superseding any active one.
    pub async fn send(&mut self, request: &GenerateRequest) -> Result<TurnStream, StreamError> {
        request.validate()?;
        self.cancel().await;
        let turn = self.client.start_turn(request)?;
        tracing::debug!(conversation = %self.id, turn_id = %turn.turn_id(), "turn sent");
        self.history.push(ChatMessage {
            role: Role::User,
            content: request.query.clone(),
        });
        self.active = Some(turn.handle());
        Ok(turn)
    }

    /// Cancels the active turn, if any, and waits for it to settle.
    pub async fn cancel(&mut self) {
        if let Some(handle) = self.active.take() {
            handle.cancel_and_wait().await;
        }
    }

    /// Appends the assistant reply of a finished turn. Cancelled, failed and
    /// empty turns leave the history untouched.
    pub fn record(&mut self, output: &TurnOutput) {
        if self
            .active
            .as_ref()
            .is_some_and(|active| active.turn_id() == output.turn_id)
        {
            self.active = None;
        }
        if output.is_complete() && !output.text.is_empty() {
            self.history.push(ChatMessage {
                role: Role::Assistant,
                content: output.text.clone(),
            });
        }
    }
}
