use tokio::sync::{mpsc, oneshot, watch};
use tracing::{Instrument as _, debug, info, info_span, warn};

use crate::accumulator::{CodeBlock, Phase, ResponseAccumulator, StreamStats, UNKNOWN_STREAM_ERROR};
use crate::errors::StreamError;
use crate::event::StreamEvent;
use crate::retry::RetryNotice;
use crate::session::{AbortHandle, EventSink, SessionOutcome, StreamSession};

/// Progress of a running turn, in the order things happened.
#[derive(Clone, Debug, PartialEq)]
pub enum TurnUpdate {
    /// A decoded event, after it was applied to the turn's accumulator.
    Event(StreamEvent),
    /// The stream dropped and will be restarted.
    Retrying(RetryNotice),
    /// Terminal: the response finished.
    Completed {
        text: String,
        code_blocks: Vec<CodeBlock>,
    },
    /// Terminal: an `error` event, a non-retryable failure, or exhausted
    /// retries.
    Failed { message: String },
    /// Terminal: the turn was cancelled.
    Cancelled,
}

impl TurnUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled
        )
    }
}

/// Final state of a turn.
#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TurnOutput {
    pub turn_id: uuid::Uuid,
    pub phase: Phase,
    pub text: String,
    pub code_blocks: Vec<CodeBlock>,
    pub stats: StreamStats,
    pub retry_count: u32,
    pub error: Option<String>,
    pub cancelled: bool,
}

impl TurnOutput {
    fn from_accumulator(turn_id: uuid::Uuid, acc: &ResponseAccumulator, cancelled: bool) -> Self {
        let snapshot = acc.output();
        Self {
            turn_id,
            phase: snapshot.phase,
            text: snapshot.text,
            code_blocks: snapshot.code_blocks,
            stats: snapshot.stats,
            retry_count: snapshot.retry_count,
            error: snapshot.error,
            cancelled,
        }
    }

    /// Whether the turn produced a finished assistant reply.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Complete && !self.cancelled
    }
}

/// Cancels a turn and waits for its task to wind down.
#[derive(Clone, Debug)]
pub struct TurnHandle {
    turn_id: uuid::Uuid,
    abort: AbortHandle,
    settled: watch::Receiver<bool>,
}

impl TurnHandle {
    pub fn turn_id(&self) -> uuid::Uuid {
        self.turn_id
    }

    pub fn is_settled(&self) -> bool {
        *self.settled.borrow()
    }

    /// Aborts the turn and resolves once its task has released the stream.
    pub async fn cancel_and_wait(mut self) {
        self.abort.abort();
        // A closed channel means the task is already gone.
        let _ = self.settled.wait_for(|settled| *settled).await;
    }
}

/// Streaming handle for one turn running on a background task.
///
/// Use `next_update()` to follow the turn as it runs and `finish()` to obtain
/// the final output. Both are optional: the task runs to the end on its own.
pub struct TurnStream {
    turn_id: uuid::Uuid,
    rx: mpsc::UnboundedReceiver<TurnUpdate>,
    final_rx: oneshot::Receiver<TurnOutput>,
    abort: AbortHandle,
    settled: watch::Receiver<bool>,
}

impl TurnStream {
    pub(crate) fn spawn(session: StreamSession, abort: AbortHandle) -> Self {
        let turn_id = uuid::Uuid::new_v4();
        // Unbounded: events are forwarded from a synchronous sink, which
        // cannot wait for capacity. `finish` drains whatever is left.
        let (tx, rx) = mpsc::unbounded_channel();
        let (final_tx, final_rx) = oneshot::channel();
        let (settled_tx, settled) = watch::channel(false);

        tokio::spawn(
            turn_task(turn_id, session, tx, final_tx, settled_tx)
                .instrument(info_span!("turn", %turn_id)),
        );

        Self {
            turn_id,
            rx,
            final_rx,
            abort,
            settled,
        }
    }

    pub fn turn_id(&self) -> uuid::Uuid {
        self.turn_id
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    /// Returns a handle that can cancel the turn and await its end, usable
    /// after the stream itself has been moved elsewhere.
    pub fn handle(&self) -> TurnHandle {
        TurnHandle {
            turn_id: self.turn_id,
            abort: self.abort.clone(),
            settled: self.settled.clone(),
        }
    }

    /// Waits for the next update. Returns `None` once the turn has ended and
    /// every update was received.
    pub async fn next_update(&mut self) -> Option<TurnUpdate> {
        self.rx.recv().await
    }

    /// Waits for the turn to end and returns its final output.
    ///
    /// Updates not yet received are drained and dropped. Failures are
    /// reported in `TurnOutput::error`; an `Err` only means the task died
    /// before producing an output.
    pub async fn finish(mut self) -> Result<TurnOutput, StreamError> {
        while self.rx.recv().await.is_some() {}
        self.final_rx.await.map_err(|_| {
            StreamError::protocol_msg(format!(
                "turn {} ended without a final output",
                self.turn_id
            ))
        })
    }
}

/// Feeds the accumulator and mirrors every event to the update channel.
struct TurnSink {
    acc: ResponseAccumulator,
    tx: mpsc::UnboundedSender<TurnUpdate>,
}

impl TurnSink {
    fn send(&self, update: TurnUpdate) {
        // Nobody listening is fine: the final output still goes out.
        let _ = self.tx.send(update);
    }
}

impl EventSink for TurnSink {
    fn on_event(&mut self, event: StreamEvent) {
        self.acc.apply(&event);
        self.send(TurnUpdate::Event(event));
    }

    fn on_retry(&mut self, notice: &RetryNotice) {
        self.acc.on_retry(notice);
        self.send(TurnUpdate::Retrying(notice.clone()));
    }
}

async fn turn_task(
    turn_id: uuid::Uuid,
    mut session: StreamSession,
    tx: mpsc::UnboundedSender<TurnUpdate>,
    final_tx: oneshot::Sender<TurnOutput>,
    settled_tx: watch::Sender<bool>,
) {
    let mut sink = TurnSink {
        acc: ResponseAccumulator::new(),
        tx,
    };
    debug!("turn started");
    let result = session.run(&mut sink).await;

    let mut cancelled = false;
    let terminal = match result {
        Ok(SessionOutcome::Completed | SessionOutcome::EndOfStream) => {
            sink.acc.finish_unterminated();
            TurnUpdate::Completed {
                text: sink.acc.text().to_string(),
                code_blocks: sink.acc.code_blocks().to_vec(),
            }
        }
        Ok(SessionOutcome::Failed) => {
            // An `error` that arrived before `start` never reached Streaming.
            sink.acc.fail(UNKNOWN_STREAM_ERROR);
            TurnUpdate::Failed {
                message: sink.acc.error().unwrap_or(UNKNOWN_STREAM_ERROR).to_string(),
            }
        }
        Ok(SessionOutcome::Cancelled) => {
            cancelled = true;
            sink.acc.cancel();
            TurnUpdate::Cancelled
        }
        Err(err) => {
            warn!(error = %err, "turn failed");
            sink.acc.fail(err.to_string());
            TurnUpdate::Failed {
                message: err.to_string(),
            }
        }
    };

    let output = TurnOutput::from_accumulator(turn_id, &sink.acc, cancelled);
    info!(
        phase = ?output.phase,
        cancelled,
        tokens = output.stats.token_count,
        retries = output.retry_count,
        "turn finished"
    );
    sink.send(terminal);
    let _ = final_tx.send(output);
    settled_tx.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryPolicy;
    use crate::session::StreamRequest;
    use crate::session::tests::{FakeAttempt, FakeTransport, HAPPY_BODY};
    use std::sync::Arc;
    use std::time::Duration;

    fn start(transport: Arc<FakeTransport>) -> TurnStream {
        let abort = AbortHandle::new();
        let session = StreamSession::new(
            transport,
            StreamRequest {
                url: "http://test/api/complete/stream".into(),
                payload: serde_json::json!({"model": "m", "query": "q", "stream": true}),
            },
            RetryPolicy::new(3, Duration::from_millis(50)),
            &abort,
        );
        TurnStream::spawn(session, abort)
    }

    async fn drain(stream: &mut TurnStream) -> Vec<TurnUpdate> {
        let mut updates = Vec::new();
        while let Some(update) = stream.next_update().await {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn completed_turn_reports_events_then_the_final_text() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(HAPPY_BODY)])]);
        let mut stream = start(transport);

        let updates = drain(&mut stream).await;
        let names: Vec<_> = updates
            .iter()
            .filter_map(|u| match u {
                TurnUpdate::Event(e) => Some(e.name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(names, ["start", "token", "token", "done"]);
        assert_eq!(
            updates.last(),
            Some(&TurnUpdate::Completed {
                text: "AB".into(),
                code_blocks: vec![]
            })
        );

        let output = stream.finish().await.expect("output");
        assert!(output.is_complete());
        assert_eq!(output.text, "AB");
        assert_eq!(output.error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_arrive_as_a_failed_update() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Fail(StreamError::transport("reset")),
            FakeAttempt::Fail(StreamError::transport("reset")),
            FakeAttempt::Fail(StreamError::transport("reset")),
        ]);
        let mut stream = start(transport.clone());

        let updates = drain(&mut stream).await;
        let retries = updates
            .iter()
            .filter(|u| matches!(u, TurnUpdate::Retrying(_)))
            .count();
        assert_eq!(retries, 2);
        assert!(matches!(
            updates.last(),
            Some(TurnUpdate::Failed { message }) if message.contains("after 3 attempts")
        ));

        let output = stream.finish().await.expect("output");
        assert_eq!(output.phase, Phase::Errored);
        assert_eq!(output.retry_count, 2);
        assert!(output.error.is_some());
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn error_event_keeps_partial_text() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(
            "event: start\ndata: {}\n\n\
event: token\ndata: {\"token\":\"half\"}\n\n\
event: error\ndata: {\"error\":\"model crashed\"}\n\n",
        )])]);
        let mut stream = start(transport);

        let updates = drain(&mut stream).await;
        assert_eq!(
            updates.last(),
            Some(&TurnUpdate::Failed {
                message: "model crashed".into()
            })
        );
        let output = stream.finish().await.expect("output");
        assert_eq!(output.text, "half");
        assert_eq!(output.error.as_deref(), Some("model crashed"));
    }

    #[tokio::test]
    async fn finish_drains_updates_nobody_read() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(HAPPY_BODY)])]);
        let mut stream = start(transport);
        assert!(matches!(stream.next_update().await, Some(TurnUpdate::Event(_))));
        let output = stream.finish().await.expect("output");
        assert_eq!(output.text, "AB");
    }

    #[tokio::test]
    async fn body_without_done_is_finalized() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(
            "event: start\ndata: {}\n\nevent: token\ndata: {\"token\":\"tail \"}\n\n",
        )])]);
        let output = start(transport).finish().await.expect("output");
        assert!(output.is_complete());
        assert_eq!(output.text, "tail");
    }

    #[tokio::test]
    async fn cancel_and_wait_settles_the_turn() {
        let transport = FakeTransport::new(vec![FakeAttempt::Hang(vec![
            "event: start\ndata: {}\n\n",
            "event: token\ndata: {\"token\":\"A\"}\n\n",
        ])]);
        let mut stream = start(transport.clone());
        let handle = stream.handle();

        loop {
            match stream.next_update().await.expect("update") {
                TurnUpdate::Event(event) if event.name == "token" => break,
                _ => {}
            }
        }
        handle.clone().cancel_and_wait().await;
        assert!(handle.is_settled());

        let rest = drain(&mut stream).await;
        assert_eq!(rest, vec![TurnUpdate::Cancelled]);
        let output = stream.finish().await.expect("output");
        assert!(output.cancelled);
        assert!(!output.is_complete());
        assert_eq!(output.phase, Phase::Complete);
        assert_eq!(output.text, "A");
        assert_eq!(transport.calls(), 1);
    }
}
