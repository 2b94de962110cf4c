//! Incremental SSE frame decoding.
//!
//! Bytes are split on `\n` only, so a multi-byte UTF-8 sequence that straddles
//! two chunks stays intact in the carry-over buffer until its line completes.
use std::collections::VecDeque;
use std::pin::Pin;

use futures::StreamExt as _;
use futures::stream;

use crate::errors::StreamError;
use crate::event::{EventData, StreamEvent};

/// Response body as a stream of byte chunks.
pub type ByteStream =
    Pin<Box<dyn futures::Stream<Item = Result<bytes::Bytes, StreamError>> + Send + 'static>>;

const DONE_SENTINEL: &str = "[DONE]";

#[derive(Default)]
struct PartialRecord {
    event: Option<String>,
    data: Option<EventData>,
    id: Option<String>,
    retry_ms: Option<u64>,
}

impl PartialRecord {
    /// Takes the record if it has both an event name and data.
    fn take_complete(&mut self) -> Option<StreamEvent> {
        if self.event.is_none()
            && let Some(data) = &self.data
            && let Some(name) = data.str_field("event")
        {
            // Frames written as `data: {"event": "...", ...}` name themselves.
            self.event = Some(name.to_string());
            if self.id.is_none() {
                self.id = data.str_field("id").map(ToOwned::to_owned);
            }
        }
        if self.event.is_none() || self.data.is_none() {
            return None;
        }
        let record = std::mem::take(self);
        Some(StreamEvent {
            name: record.event?,
            data: record.data?,
            id: record.id,
            retry_ms: record.retry_ms,
        })
    }
}

/// Line-oriented SSE decoder with carry-over between chunks.
///
/// A record is emitted when a blank line or `data: [DONE]` terminates it, or
/// when `finish` is called at end of stream, provided it has both an `event`
/// name and a `data` value.
#[derive(Default)]
pub struct FrameDecoder {
    pending: Vec<u8>,
    record: PartialRecord,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet part of a complete line.
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Feeds one chunk and returns the records it completed, in order.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        let mut consumed = 0;
        while let Some(offset) = self.pending[consumed..].iter().position(|b| *b == b'\n') {
            let end = consumed + offset;
            let line = String::from_utf8_lossy(&self.pending[consumed..end]).into_owned();
            consumed = end + 1;
            if let Some(event) = self.process_line(&line) {
                events.push(event);
            }
        }
        self.pending.drain(..consumed);
        events
    }

    /// Signals end of stream, flushing an unterminated last line and any
    /// complete in-progress record.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        let mut flushed = None;
        if !self.pending.is_empty() {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            flushed = self.process_line(&line);
        }
        flushed.or_else(|| self.record.take_complete())
    }

    fn process_line(&mut self, raw_line: &str) -> Option<StreamEvent> {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        if line.is_empty() {
            return self.record.take_complete();
        }
        if let Some(rest) = line.strip_prefix("data:") {
            if rest.trim() == DONE_SENTINEL {
                return self.record.take_complete();
            }
            self.record.data = Some(EventData::parse(rest));
        } else if let Some(rest) = line.strip_prefix("event:") {
            self.record.event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            self.record.id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            if let Ok(ms) = rest.trim().parse::<u64>() {
                self.record.retry_ms = Some(ms);
            }
        }
        None
    }
}

/// Decodes a body stream lazily into events.
///
/// Each call owns a fresh decoder; the returned stream is not restartable.
/// A read failure ends the stream with that error.
pub fn decode_stream(
    body: ByteStream,
) -> impl futures::Stream<Item = Result<StreamEvent, StreamError>> + Send {
    struct State {
        body: ByteStream,
        decoder: FrameDecoder,
        pending: VecDeque<StreamEvent>,
        done: bool,
    }

    stream::try_unfold(
        State {
            body,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.pending.pop_front() {
                    return Ok(Some((event, state)));
                }
                if state.done {
                    return Ok(None);
                }

                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        state.pending.extend(state.decoder.push_chunk(&chunk));
                    }
                    Some(Err(err)) => return Err(err),
                    None => {
                        state.done = true;
                        state.pending.extend(state.decoder.finish());
                    }
                }
            }
        },
    )
}
