use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::errors::StreamError;
use crate::event::{EventKind, StreamEvent};
use crate::retry::{RetryNotice, RetryPolicy};
use crate::sse::decode_stream;
use crate::transport::Transport;

/// Handle used to cancel a stream session.
///
/// Cancelling aborts the in-flight request, any pending retry delay, and all
/// further event dispatch. Clones share the same flag.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for AbortHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl AbortHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Requests cancellation. Idempotent.
    pub fn abort(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_aborted(&self) -> bool {
        *self.tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Receives decoded events from a session, in wire order.
pub trait EventSink {
    fn on_event(&mut self, event: StreamEvent);

    /// Called before the session sleeps ahead of a restart.
    fn on_retry(&mut self, _notice: &RetryNotice) {}
}

impl<F> EventSink for F
where
    F: FnMut(StreamEvent),
{
    fn on_event(&mut self, event: StreamEvent) {
        self(event)
    }
}

/// How a session ended without an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    /// A `done` event was dispatched.
    Completed,
    /// An `error` event was dispatched. Application errors are never retried.
    Failed,
    /// The body ended before any terminal event.
    EndOfStream,
    /// The abort handle fired.
    Cancelled,
}

/// URL and JSON body of one streaming exchange.
#[derive(Clone, Debug, PartialEq)]
pub struct StreamRequest {
    pub url: String,
    pub payload: serde_json::Value,
}

/// Drives one streaming request end to end: issues the call, decodes the
/// body, dispatches events, and restarts the whole request on transport
/// failure with linear backoff.
pub struct StreamSession {
    transport: Arc<dyn Transport>,
    request: StreamRequest,
    policy: RetryPolicy,
    idle_timeout: Option<Duration>,
    abort_rx: watch::Receiver<bool>,
    attempt: u32,
    retry_hint: Option<Duration>,
}

impl StreamSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        request: StreamRequest,
        policy: RetryPolicy,
        abort: &AbortHandle,
    ) -> Self {
        Self {
            transport,
            request,
            policy,
            idle_timeout: None,
            abort_rx: abort.subscribe(),
            attempt: 0,
            retry_hint: None,
        }
    }

    /// Treats `timeout` of silence between chunks as a dropped connection.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Failed attempts since the session began.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    fn is_aborted(&self) -> bool {
        *self.abort_rx.borrow()
    }

    /// Runs the session until a terminal event, end of body, cancellation, or
    /// an unrecoverable error.
    ///
    /// Only one request is in flight at a time: a retry starts after the
    /// failed attempt has been dropped.
    pub async fn run<S>(&mut self, sink: &mut S) -> Result<SessionOutcome, StreamError>
    where
        S: EventSink + ?Sized,
    {
        loop {
            if self.is_aborted() {
                return Ok(SessionOutcome::Cancelled);
            }
            let err = match self.run_attempt(sink).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) => err,
            };
            if self.is_aborted() {
                return Ok(SessionOutcome::Cancelled);
            }
            if !err.is_retryable() {
                warn!(url = %self.request.url, error = %err, "stream failed; not retrying");
                return Err(err);
            }

            self.attempt += 1;
            if !self.policy.allows(self.attempt) {
                warn!(url = %self.request.url, attempts = self.attempt, error = %err, "stream retries exhausted");
                return Err(StreamError::RetriesExhausted {
                    attempts: self.attempt,
                    last: err.to_string(),
                });
            }

            let delay = self.policy.delay_with_hint(self.attempt, self.retry_hint);
            info!(
                url = %self.request.url,
                attempt = self.attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "stream interrupted; retrying"
            );
            sink.on_retry(&RetryNotice {
                attempt: self.attempt,
                max_retries: self.policy.max_retries,
                delay,
                reason: err.to_string(),
            });
            tokio::select! {
                biased;
                _ = wait_for_abort(&mut self.abort_rx) => return Ok(SessionOutcome::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn run_attempt<S>(&mut self, sink: &mut S) -> Result<SessionOutcome, StreamError>
    where
        S: EventSink + ?Sized,
    {
        debug!(url = %self.request.url, attempt = self.attempt, "opening stream");
        let body = tokio::select! {
            biased;
            _ = wait_for_abort(&mut self.abort_rx) => return Ok(SessionOutcome::Cancelled),
            opened = self.transport.open(&self.request.url, &self.request.payload) => opened?,
        };
        let mut events = Box::pin(decode_stream(body));

        loop {
            if self.is_aborted() {
                return Ok(SessionOutcome::Cancelled);
            }
            let next = tokio::select! {
                biased;
                _ = wait_for_abort(&mut self.abort_rx) => return Ok(SessionOutcome::Cancelled),
                next = next_with_idle(&mut events, self.idle_timeout) => next?,
            };
            let Some(event) = next else {
                debug!(url = %self.request.url, "stream ended without a terminal event");
                return Ok(SessionOutcome::EndOfStream);
            };
            let event = event?;

            if let Some(ms) = event.retry_ms {
                self.retry_hint = Some(Duration::from_millis(ms));
            }
            let kind = event.kind();
            debug!(event = %event.name, "dispatching stream event");
            sink.on_event(event);

            match kind {
                EventKind::Done => return Ok(SessionOutcome::Completed),
                EventKind::Error => return Ok(SessionOutcome::Failed),
                _ => {}
            }
        }
    }
}

async fn next_with_idle<St>(
    events: &mut St,
    idle_timeout: Option<Duration>,
) -> Result<Option<St::Item>, StreamError>
where
    St: futures::Stream + Unpin,
{
    match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, events.next())
            .await
            .map_err(|_| StreamError::IdleTimeout(limit)),
        None => Ok(events.next().await),
    }
}

/// Resolves once the abort flag is set. Never resolves if every handle is
/// dropped without aborting.
async fn wait_for_abort(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|aborted| *aborted).await.is_err() {
        futures::future::pending::<()>().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::sse::ByteStream;
    use futures::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted response for one `open` call.
    pub(crate) enum FakeAttempt {
        /// `open` fails with this error.
        Fail(StreamError),
        /// The body yields these chunks, then ends.
        Body(Vec<Result<&'static str, StreamError>>),
        /// The body yields these chunks, then never ends.
        Hang(Vec<&'static str>),
    }

    /// In-memory transport replaying scripted attempts and counting calls
    /// and body reads.
    pub(crate) struct FakeTransport {
        attempts: Mutex<VecDeque<FakeAttempt>>,
        pub(crate) calls: AtomicUsize,
        pub(crate) reads: Arc<AtomicUsize>,
    }

    impl FakeTransport {
        pub(crate) fn new(attempts: Vec<FakeAttempt>) -> Arc<Self> {
            Arc::new(Self {
                attempts: Mutex::new(attempts.into()),
                calls: AtomicUsize::new(0),
                reads: Arc::new(AtomicUsize::new(0)),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn reads(&self) -> usize {
            self.reads.load(Ordering::SeqCst)
        }
    }

    fn counted(reads: Arc<AtomicUsize>, inner: ByteStream) -> ByteStream {
        Box::pin(stream::unfold((reads, inner), |(reads, mut inner)| async move {
            reads.fetch_add(1, Ordering::SeqCst);
            let item = inner.next().await?;
            Some((item, (reads, inner)))
        }))
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn open(
            &self,
            _url: &str,
            _payload: &serde_json::Value,
        ) -> Result<ByteStream, StreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self
                .attempts
                .lock()
                .expect("attempts lock")
                .pop_front()
                .unwrap_or(FakeAttempt::Fail(StreamError::transport("no scripted attempt")));
            let body: ByteStream = match next {
                FakeAttempt::Fail(err) => return Err(err),
                FakeAttempt::Body(chunks) => Box::pin(stream::iter(
                    chunks
                        .into_iter()
                        .map(|c| c.map(|s| bytes::Bytes::from_static(s.as_bytes()))),
                )),
                FakeAttempt::Hang(chunks) => Box::pin(
                    stream::iter(
                        chunks
                            .into_iter()
                            .map(|s| Ok(bytes::Bytes::from_static(s.as_bytes()))),
                    )
                    .chain(stream::pending()),
                ),
            };
            Ok(counted(self.reads.clone(), body))
        }
    }

    pub(crate) const HAPPY_BODY: &str = "event: start\ndata: {}\n\n\
event: token\ndata: {\"token\":\"A\"}\n\n\
event: token\ndata: {\"token\":\"B\"}\n\n\
event: done\ndata: {}\n\n";

    fn session(transport: Arc<FakeTransport>, abort: &AbortHandle) -> StreamSession {
        StreamSession::new(
            transport,
            StreamRequest {
                url: "http://test/api/complete/stream".into(),
                payload: serde_json::json!({"model": "m", "query": "q", "stream": true}),
            },
            RetryPolicy::new(3, Duration::from_millis(100)),
            abort,
        )
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<String>,
        retries: Vec<RetryNotice>,
    }

    impl EventSink for Recorder {
        fn on_event(&mut self, event: StreamEvent) {
            self.events.push(event.name);
        }

        fn on_retry(&mut self, notice: &RetryNotice) {
            self.retries.push(notice.clone());
        }
    }

    #[tokio::test]
    async fn dispatches_events_in_order_and_completes_on_done() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(HAPPY_BODY)])]);
        let abort = AbortHandle::new();
        let mut names = Vec::new();
        let outcome = session(transport.clone(), &abort)
            .run(&mut |event: StreamEvent| names.push(event.name))
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(names, vec!["start", "token", "token", "done"]);
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn bodies_that_drop_after_start_still_exhaust_the_retry_budget() {
        let attempts = (0..10)
            .map(|_| {
                FakeAttempt::Body(vec![
                    Ok("event: start\ndata: {}\n\n"),
                    Err(StreamError::transport("reset")),
                ])
            })
            .collect();
        let transport = FakeTransport::new(attempts);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        let started = tokio::time::Instant::now();
        let err = session(transport.clone(), &abort)
            .run(&mut recorder)
            .await
            .expect_err("exhausted");

        assert_eq!(
            err,
            StreamError::RetriesExhausted {
                attempts: 3,
                last: "transport error: reset".into()
            }
        );
        assert_eq!(transport.calls(), 3);
        assert_eq!(
            recorder.retries.iter().map(|n| n.attempt).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(recorder.events, vec!["start", "start", "start"]);
        assert!(started.elapsed() >= Duration::from_millis(100 + 200));
    }

    #[tokio::test(start_paused = true)]
    async fn three_consecutive_transport_failures_make_exactly_three_calls() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Fail(StreamError::transport("down")),
            FakeAttempt::Fail(StreamError::transport("down")),
            FakeAttempt::Fail(StreamError::transport("down")),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        let err = session(transport.clone(), &abort)
            .run(&mut recorder)
            .await
            .expect_err("exhausted");
        assert_eq!(
            err,
            StreamError::RetriesExhausted {
                attempts: 3,
                last: "transport error: down".into()
            }
        );
        assert_eq!(transport.calls(), 3);
        assert_eq!(recorder.retries.len(), 2);
        assert_eq!(recorder.retries[1].delay, Duration::from_millis(200));
        assert!(recorder.events.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_a_transient_failure() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Fail(StreamError::transport("refused")),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        let outcome = session(transport.clone(), &abort)
            .run(&mut recorder)
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(transport.calls(), 2);
        assert_eq!(recorder.retries.len(), 1);
        assert_eq!(recorder.events, vec!["start", "token", "token", "done"]);
    }

    #[tokio::test]
    async fn status_errors_are_not_retried() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Fail(StreamError::Status {
                status: 500,
                body: "boom".into(),
            }),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let err = session(transport.clone(), &abort)
            .run(&mut |_: StreamEvent| {})
            .await
            .expect_err("status error");
        assert!(matches!(err, StreamError::Status { status: 500, .. }));
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn error_event_ends_the_session_without_retrying() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Hang(vec![
                "event: start\ndata: {}\n\nevent: error\ndata: {\"error\":\"model not found\"}\n\n",
            ]),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        let outcome = session(transport.clone(), &abort)
            .run(&mut recorder)
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::Failed);
        assert_eq!(recorder.events, vec!["start", "error"]);
        assert!(recorder.retries.is_empty());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test]
    async fn cancel_after_first_token_stops_dispatch_and_reads() {
        let transport = FakeTransport::new(vec![FakeAttempt::Hang(vec![
            "event: start\ndata: {}\n\nevent: token\ndata: {\"token\":\"A\"}\n\nevent: token\ndata: {\"token\":\"B\"}\n\n",
            "event: done\ndata: {}\n\n",
        ])]);
        let abort = AbortHandle::new();
        let canceller = abort.clone();
        let mut names = Vec::new();
        let outcome = session(transport.clone(), &abort)
            .run(&mut |event: StreamEvent| {
                let is_token = event.name == "token";
                names.push(event.name);
                if is_token {
                    canceller.abort();
                }
            })
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(names, vec!["start", "token"]);
        assert_eq!(transport.reads(), 1);
    }

    #[tokio::test]
    async fn cancel_while_waiting_for_bytes_returns_promptly() {
        let transport = FakeTransport::new(vec![FakeAttempt::Hang(vec![
            "event: start\ndata: {}\n\n",
        ])]);
        let abort = AbortHandle::new();
        let canceller = abort.clone();
        let handle = tokio::spawn(async move {
            let mut count = 0_usize;
            let outcome = session(transport, &abort)
                .run(&mut |_: StreamEvent| count += 1)
                .await;
            (outcome, count)
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.abort();
        let (outcome, count) = handle.await.expect("join");
        assert_eq!(outcome, Ok(SessionOutcome::Cancelled));
        assert_eq!(count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_prevents_the_retry() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Fail(StreamError::transport("refused")),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let canceller = abort.clone();
        let fake = transport.clone();
        let handle = tokio::spawn(async move {
            let mut recorder = Recorder::default();
            let outcome = session(fake, &abort).run(&mut recorder).await;
            (outcome, recorder)
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.abort();
        let (outcome, recorder) = handle.await.expect("join");
        assert_eq!(outcome, Ok(SessionOutcome::Cancelled));
        assert_eq!(recorder.retries.len(), 1);
        assert!(recorder.events.is_empty());
        assert_eq!(transport.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_counts_as_a_transport_failure() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Hang(vec!["event: start\ndata: {}\n\n"]),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        let outcome = session(transport.clone(), &abort)
            .with_idle_timeout(Some(Duration::from_secs(5)))
            .run(&mut recorder)
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::Completed);
        assert_eq!(transport.calls(), 2);
        assert!(recorder.retries[0].reason.contains("no data received"));
        assert_eq!(
            recorder.events,
            vec!["start", "start", "token", "token", "done"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn server_retry_hint_replaces_the_base_delay() {
        let transport = FakeTransport::new(vec![
            FakeAttempt::Body(vec![
                Ok("retry: 40\nevent: start\ndata: {}\n\n"),
                Err(StreamError::transport("reset")),
            ]),
            FakeAttempt::Body(vec![Ok(HAPPY_BODY)]),
        ]);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        session(transport, &abort)
            .run(&mut recorder)
            .await
            .expect("run");
        assert_eq!(recorder.retries[0].delay, Duration::from_millis(40));
    }

    #[tokio::test]
    async fn body_without_terminal_event_is_end_of_stream() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(
            "event: start\ndata: {}\n\nevent: token\ndata: {\"token\":\"A\"}",
        )])]);
        let abort = AbortHandle::new();
        let mut recorder = Recorder::default();
        let outcome = session(transport, &abort)
            .run(&mut recorder)
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::EndOfStream);
        assert_eq!(recorder.events, vec!["start", "token"]);
    }

    #[tokio::test]
    async fn pre_aborted_session_never_calls_the_transport() {
        let transport = FakeTransport::new(vec![FakeAttempt::Body(vec![Ok(HAPPY_BODY)])]);
        let abort = AbortHandle::new();
        abort.abort();
        let outcome = session(transport.clone(), &abort)
            .run(&mut |_: StreamEvent| {})
            .await
            .expect("run");
        assert_eq!(outcome, SessionOutcome::Cancelled);
        assert_eq!(transport.calls(), 0);
    }
}
