use serde_json::{Map, Value};

use crate::errors::StreamError;

/// One or many attachments (`image` / `file` accept both shapes).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum Attachments {
    One(String),
    Many(Vec<String>),
}

/// How long the service should keep the model loaded (`"5m"` or seconds).
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum KeepAlive {
    Duration(String),
    Seconds(i64),
}

/// JSON body of a streaming generation request.
///
/// Every value the service needs (model, persona, locale) is set explicitly
/// by the caller; nothing is read from ambient state.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub query: String,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<Attachments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<Attachments>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub think: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keepalive: Option<KeepAlive>,
    /// Sampling options forwarded to the model (`temperature`, `top_p`, ...).
    #[serde(skip_serializing_if = "Map::is_empty", default)]
    pub options: Map<String, Value>,
    /// Service-specific fields merged into the top level of the body.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerateRequest {
    /// Creates a streaming request for `model` with the user's `query`.
    pub fn new(model: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            query: query.into(),
            stream: true,
            persona: None,
            language: None,
            chat: None,
            image: None,
            file: None,
            think: None,
            keepalive: None,
            options: Map::new(),
            extra: Map::new(),
        }
    }

    pub fn persona(mut self, persona: impl Into<String>) -> Self {
        self.persona = Some(persona.into());
        self
    }

    /// Sets the response language (service default `en`).
    pub fn language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }

    pub fn chat(mut self, chat: bool) -> Self {
        self.chat = Some(chat);
        self
    }

    /// Attaches one image; repeated calls collect several.
    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(push_attachment(self.image.take(), image.into()));
        self
    }

    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.file = Some(push_attachment(self.file.take(), file.into()));
        self
    }

    /// Asks reasoning-capable models to emit their thinking.
    pub fn think(mut self, think: bool) -> Self {
        self.think = Some(think);
        self
    }

    pub fn keepalive(mut self, keepalive: KeepAlive) -> Self {
        self.keepalive = Some(keepalive);
        self
    }

    /// Sets one entry of the `options` object.
    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Adds a top-level field the typed API does not cover.
    ///
    /// Keys owned by typed fields are rejected at validation time.
    pub fn extra_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn validate(&self) -> Result<(), StreamError> {
        if self.model.trim().is_empty() {
            return Err(StreamError::Validation("model must not be empty".into()));
        }
        if self.query.trim().is_empty() {
            return Err(StreamError::Validation("query must not be empty".into()));
        }
        const RESERVED: [&str; 11] = [
            "model", "query", "stream", "persona", "language", "chat", "image", "file", "think",
            "keepalive", "options",
        ];
        if let Some(key) = self.extra.keys().find(|key| RESERVED.contains(&key.as_str())) {
            return Err(StreamError::Validation(format!(
                "extra field {key:?} collides with a typed request field"
            )));
        }
        Ok(())
    }

    /// Validates and serializes the request body.
    pub fn to_payload(&self) -> Result<Value, StreamError> {
        self.validate()?;
        serde_json::to_value(self)
            .map_err(|e| StreamError::Validation(format!("failed to serialize request: {e}")))
    }
}

fn push_attachment(existing: Option<Attachments>, item: String) -> Attachments {
    match existing {
        None => Attachments::One(item),
        Some(Attachments::One(first)) => Attachments::Many(vec![first, item]),
        Some(Attachments::Many(mut items)) => {
            items.push(item);
            Attachments::Many(items)
        }
    }
}
