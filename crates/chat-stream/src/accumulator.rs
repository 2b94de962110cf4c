//! Per-turn response state built from dispatched stream events.
use tracing::debug;

use crate::event::{
    CodeEndPayload, CodeStartPayload, CodeTokenPayload, ErrorPayload, EventKind, MetadataPayload,
    ProgressPayload, StreamEvent, TokenPayload,
};
use crate::retry::RetryNotice;
use crate::session::EventSink;

/// Message used when an `error` event carries no message.
pub const UNKNOWN_STREAM_ERROR: &str = "Unknown streaming error";

const DEFAULT_CODE_LANGUAGE: &str = "text";

/// Lifecycle of one request/response turn.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Phase {
    #[default]
    Idle,
    Streaming,
    Complete,
    Errored,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Errored)
    }
}

/// A fenced code block detected in the response.
///
/// Offsets are byte offsets into the response text.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CodeBlock {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, alias = "start")]
    pub start_offset: usize,
    #[serde(default, alias = "end")]
    pub end_offset: usize,
}

fn default_language() -> String {
    DEFAULT_CODE_LANGUAGE.to_string()
}

/// Token and timing statistics.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct StreamStats {
    pub token_count: u64,
    pub tokens_per_second: f64,
    pub elapsed_ms: u64,
    pub total_duration_ms: Option<u64>,
    pub code_blocks_detected: Option<u64>,
}

impl StreamStats {
    fn raise_token_count(&mut self, count: u64) {
        self.token_count = self.token_count.max(count);
    }
}

/// Point-in-time copy of an accumulator's state.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ResponseSnapshot {
    pub phase: Phase,
    pub text: String,
    pub code_blocks: Vec<CodeBlock>,
    pub stats: StreamStats,
    pub retry_count: u32,
    /// Message passed to the error callback, when the turn errored.
    pub error: Option<String>,
}

type CompleteCallback = Box<dyn FnMut(&str, &[CodeBlock]) + Send>;
type ErrorCallback = Box<dyn FnMut(&str) + Send>;

/// Builds the visible transcript of one turn from stream events.
///
/// Text only grows while `Streaming` and is frozen once the turn is
/// `Complete` or `Errored`; partial text survives errors.
#[derive(Default)]
pub struct ResponseAccumulator {
    phase: Phase,
    text: String,
    code_blocks: Vec<CodeBlock>,
    stats: StreamStats,
    retry_count: u32,
    active_code_block: Option<String>,
    code_scratch: String,
    code_start_offset: usize,
    error: Option<String>,
    on_complete: Option<CompleteCallback>,
    on_error: Option<ErrorCallback>,
}

impl ResponseAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the completion callback, invoked once with the trimmed text
    /// and the code blocks when `done` arrives.
    pub fn on_complete(mut self, callback: impl FnMut(&str, &[CodeBlock]) + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Registers the error callback, invoked once with a human-readable
    /// message.
    pub fn on_error(mut self, callback: impl FnMut(&str) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(callback));
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn code_blocks(&self) -> &[CodeBlock] {
        &self.code_blocks
    }

    pub fn stats(&self) -> &StreamStats {
        &self.stats
    }

    /// Retry notices seen since the last `start` event.
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn active_code_block(&self) -> Option<&str> {
        self.active_code_block.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn output(&self) -> ResponseSnapshot {
        ResponseSnapshot {
            phase: self.phase,
            text: self.text.clone(),
            code_blocks: self.code_blocks.clone(),
            stats: self.stats.clone(),
            retry_count: self.retry_count,
            error: self.error.clone(),
        }
    }

    /// Applies one event to the state machine.
    pub fn apply(&mut self, event: &StreamEvent) {
        let kind = event.kind();
        if kind == EventKind::Start {
            self.begin();
            return;
        }
        if self.phase != Phase::Streaming {
            debug!(event = %event.name, phase = ?self.phase, "ignoring event outside streaming phase");
            return;
        }

        match kind {
            EventKind::Token => {
                let payload: TokenPayload = event.payload();
                let text = payload.text().or(event.data.as_raw());
                if let Some(text) = text {
                    self.text.push_str(text);
                }
                match payload.count() {
                    Some(count) => self.stats.raise_token_count(count),
                    None if text.is_some() => self.stats.token_count += 1,
                    None => {}
                }
            }
            EventKind::CodeStart => {
                let payload: CodeStartPayload = event.payload();
                self.active_code_block = Some(
                    payload
                        .code_block_id
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                );
                self.code_scratch.clear();
                self.code_start_offset = self.text.len();
            }
            EventKind::CodeToken => {
                let payload: CodeTokenPayload = event.payload();
                if let Some(token) = payload.token.as_deref().or(event.data.as_raw()) {
                    self.code_scratch.push_str(token);
                    self.text.push_str(token);
                }
            }
            EventKind::CodeEnd => {
                let payload: CodeEndPayload = event.payload();
                let scratch = std::mem::take(&mut self.code_scratch);
                let start_offset = if self.active_code_block.take().is_some() {
                    self.code_start_offset
                } else {
                    self.text.len()
                };
                self.code_blocks.push(CodeBlock {
                    language: payload
                        .language
                        .filter(|l| !l.trim().is_empty())
                        .unwrap_or_else(default_language),
                    content: payload.content.unwrap_or(scratch),
                    start_offset,
                    end_offset: self.text.len(),
                });
            }
            EventKind::Progress => {
                let payload: ProgressPayload = event.payload();
                if let Some(count) = payload.count() {
                    self.stats.raise_token_count(count);
                }
                if let Some(rate) = payload.tokens_per_second {
                    self.stats.tokens_per_second = rate;
                }
                if let Some(elapsed) = payload.elapsed_secs() {
                    self.stats.elapsed_ms = seconds_to_ms(elapsed);
                }
            }
            EventKind::Metadata => {
                let payload: MetadataPayload = event.payload();
                if let Some(duration) = payload.duration_ms() {
                    self.stats.total_duration_ms = Some(duration.max(0.0).round() as u64);
                }
                if let Some(rate) = payload.tokens_per_second {
                    self.stats.tokens_per_second = rate;
                }
                if let Some(total) = payload.total_tokens {
                    self.stats.raise_token_count(total);
                }
                if let Some(detected) = payload.code_blocks_detected {
                    self.stats.code_blocks_detected = Some(detected);
                }
                if let Some(blocks) = payload.code_blocks {
                    self.code_blocks = blocks
                        .into_iter()
                        .filter_map(|block| serde_json::from_value(block).ok())
                        .collect();
                }
            }
            EventKind::Done => self.complete(),
            EventKind::Error => {
                let payload: ErrorPayload = event.payload();
                let message = payload
                    .error
                    .or_else(|| event.data.as_raw().map(ToOwned::to_owned))
                    .filter(|m| !m.trim().is_empty())
                    .unwrap_or_else(|| UNKNOWN_STREAM_ERROR.to_string());
                self.fail(message);
            }
            EventKind::Start => {}
            EventKind::Other => {
                debug!(event = %event.name, "ignoring unknown stream event");
            }
        }
    }

    /// Marks a user-initiated stop: `Complete` without invoking any callback.
    pub fn cancel(&mut self) {
        if !self.phase.is_terminal() {
            self.active_code_block = None;
            self.phase = Phase::Complete;
        }
    }

    /// Moves a non-terminal turn to `Errored` and invokes the error callback.
    pub fn fail(&mut self, message: impl Into<String>) {
        if self.phase.is_terminal() {
            return;
        }
        let message = message.into();
        self.phase = Phase::Errored;
        self.active_code_block = None;
        if let Some(callback) = self.on_error.as_mut() {
            callback(&message);
        }
        self.error = Some(message);
    }

    /// Finalizes a turn whose body ended without `done`, as if `done` had
    /// arrived. A turn that never started is simply marked complete.
    pub fn finish_unterminated(&mut self) {
        match self.phase {
            Phase::Streaming => self.complete(),
            Phase::Idle => self.phase = Phase::Complete,
            Phase::Complete | Phase::Errored => {}
        }
    }

    fn begin(&mut self) {
        self.text.clear();
        self.code_blocks.clear();
        self.stats = StreamStats::default();
        self.retry_count = 0;
        self.active_code_block = None;
        self.code_scratch.clear();
        self.code_start_offset = 0;
        self.error = None;
        self.phase = Phase::Streaming;
    }

    fn complete(&mut self) {
        let trimmed = self.text.trim();
        if trimmed.len() != self.text.len() {
            let leading = self.text.len() - self.text.trim_start().len();
            self.text = trimmed.to_string();
            for block in &mut self.code_blocks {
                block.start_offset = block.start_offset.saturating_sub(leading).min(self.text.len());
                block.end_offset = block.end_offset.saturating_sub(leading).min(self.text.len());
            }
        }
        self.active_code_block = None;
        self.phase = Phase::Complete;
        if let Some(callback) = self.on_complete.as_mut() {
            callback(&self.text, &self.code_blocks);
        }
    }
}

impl EventSink for ResponseAccumulator {
    fn on_event(&mut self, event: StreamEvent) {
        self.apply(&event);
    }

    fn on_retry(&mut self, _notice: &RetryNotice) {
        self.retry_count += 1;
    }
}

fn seconds_to_ms(seconds: f64) -> u64 {
    (seconds.max(0.0) * 1000.0).round() as u64
}
