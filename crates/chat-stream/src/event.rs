use serde::Deserialize as _;
use serde::Deserializer;
use serde::de::DeserializeOwned;

/// Payload carried by a frame's `data:` field.
#[derive(Clone, Debug, PartialEq)]
pub enum EventData {
    /// The remainder parsed as JSON.
    Json(serde_json::Value),
    /// The trimmed remainder, kept verbatim because it was not valid JSON.
    Raw(String),
}

impl EventData {
    /// Parses a `data:` remainder, degrading to `Raw` on malformed JSON.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        match serde_json::from_str(trimmed) {
            Ok(value) => Self::Json(value),
            Err(_) => Self::Raw(trimmed.to_string()),
        }
    }

    /// Returns the JSON value, if any.
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            Self::Raw(_) => None,
        }
    }

    /// Returns the raw string, if the payload could not be parsed.
    pub fn as_raw(&self) -> Option<&str> {
        match self {
            Self::Json(_) => None,
            Self::Raw(raw) => Some(raw),
        }
    }

    pub(crate) fn str_field(&self, key: &str) -> Option<&str> {
        self.as_json()
            .and_then(|value| value.get(key))
            .and_then(|value| value.as_str())
    }
}

/// Known event tags. Anything else maps to `Other` and is ignored by
/// consumers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Start,
    Token,
    CodeStart,
    CodeToken,
    CodeEnd,
    Progress,
    Metadata,
    Done,
    Error,
    Other,
}

impl EventKind {
    /// Classifies a wire tag.
    pub fn from_name(name: &str) -> Self {
        match name {
            "start" => Self::Start,
            "token" | "content" => Self::Token,
            "code_start" => Self::CodeStart,
            "code_token" => Self::CodeToken,
            "code_end" => Self::CodeEnd,
            "progress" => Self::Progress,
            "metadata" => Self::Metadata,
            "done" => Self::Done,
            "error" => Self::Error,
            _ => Self::Other,
        }
    }

    /// `done` and `error` close a session.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

/// One decoded SSE record.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamEvent {
    /// Event tag as sent on the wire.
    pub name: String,
    pub data: EventData,
    pub id: Option<String>,
    /// Reconnection hint from a `retry:` line, in milliseconds.
    pub retry_ms: Option<u64>,
}

impl StreamEvent {
    /// Creates an event with JSON data and no frame metadata.
    pub fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            data: EventData::Json(data),
            id: None,
            retry_ms: None,
        }
    }

    pub fn kind(&self) -> EventKind {
        EventKind::from_name(&self.name)
    }

    /// Deserializes the JSON payload into `T`.
    ///
    /// Raw payloads and shape mismatches yield `T::default()`: payload fields
    /// are backend-defined and every one of them is optional.
    pub fn payload<T>(&self) -> T
    where
        T: DeserializeOwned + Default,
    {
        match &self.data {
            EventData::Json(value) => serde_json::from_value(value.clone()).unwrap_or_default(),
            EventData::Raw(_) => T::default(),
        }
    }
}

/// Field deserializer that never fails: a value of the wrong shape reads as
/// absent, so one odd field cannot discard the rest of the payload.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// Counts arrive as integers or floats (`2`, `2.0`).
fn lenient_count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| {
        v.as_u64().or_else(|| {
            v.as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f.round() as u64)
        })
    }))
}

/// `token` / `content` payload.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct TokenPayload {
    #[serde(deserialize_with = "lenient")]
    pub token: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub content: Option<String>,
    #[serde(deserialize_with = "lenient_count")]
    pub count: Option<u64>,
    #[serde(deserialize_with = "lenient_count")]
    pub token_count: Option<u64>,
}

impl TokenPayload {
    /// `token` wins over `content` when both are sent.
    pub fn text(&self) -> Option<&str> {
        self.token.as_deref().or(self.content.as_deref())
    }

    /// Running token count, from `count` or `token_count`.
    pub fn count(&self) -> Option<u64> {
        self.count.max(self.token_count)
    }
}

/// Identifier of a code block, sent as either a number or a string.
#[derive(Clone, Debug, PartialEq, serde::Deserialize)]
#[serde(untagged)]
pub enum CodeBlockId {
    Number(i64),
    Text(String),
}

impl std::fmt::Display for CodeBlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct CodeStartPayload {
    #[serde(deserialize_with = "lenient")]
    pub code_block_id: Option<CodeBlockId>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct CodeTokenPayload {
    #[serde(deserialize_with = "lenient")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct CodeEndPayload {
    #[serde(deserialize_with = "lenient")]
    pub language: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub content: Option<String>,
}

/// `progress` payload. Elapsed time is in seconds.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ProgressPayload {
    #[serde(deserialize_with = "lenient_count")]
    pub count: Option<u64>,
    #[serde(deserialize_with = "lenient_count")]
    pub token_count: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub tokens_per_second: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub elapsed: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub elapsed_time: Option<f64>,
}

impl ProgressPayload {
    pub fn count(&self) -> Option<u64> {
        self.count.max(self.token_count)
    }

    pub fn elapsed_secs(&self) -> Option<f64> {
        self.elapsed.or(self.elapsed_time)
    }
}

/// `metadata` payload. Durations are in milliseconds.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct MetadataPayload {
    #[serde(deserialize_with = "lenient")]
    pub duration: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub total_duration: Option<f64>,
    #[serde(deserialize_with = "lenient")]
    pub tokens_per_second: Option<f64>,
    #[serde(deserialize_with = "lenient_count")]
    pub total_tokens: Option<u64>,
    #[serde(deserialize_with = "lenient_count")]
    pub code_blocks_detected: Option<u64>,
    #[serde(deserialize_with = "lenient")]
    pub code_blocks: Option<Vec<serde_json::Value>>,
}

impl MetadataPayload {
    pub fn duration_ms(&self) -> Option<f64> {
        self.duration.or(self.total_duration)
    }
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    #[serde(deserialize_with = "lenient")]
    pub error: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub error_type: Option<String>,
}
