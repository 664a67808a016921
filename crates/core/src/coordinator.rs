use crate::event::{AgentEvent, EventKind, FromEventKind};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Capacity of the queue the loop polls; the shared channel itself is
/// unbounded so producers never block.
const DRAIN_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("timed out waiting for response to request '{request_id}'")]
    Timeout { request_id: String },
    #[error("wait for request '{request_id}' was cancelled")]
    Cancelled { request_id: String },
    #[error("response to request '{request_id}' had type '{got}'")]
    TypeMismatch { request_id: String, got: &'static str },
}

type WaiterMap = std::sync::Arc<Mutex<HashMap<String, oneshot::Sender<AgentEvent>>>>;

/// Per-turn event plane: a serialized ordering of events from any producer
/// plus a typed request/response rendezvous.
///
/// Producers call [`emit`](Self::emit); a background drainer moves events
/// into a bounded queue the loop polls at safe points. Responses are routed
/// through single-shot waiters keyed by `request_id`. The emitter of a
/// request event is responsible for emitting it before waiting; the
/// coordinator only routes the reply.
pub struct TurnCoordinator {
    tx: mpsc::UnboundedSender<AgentEvent>,
    waiters: WaiterMap,
}

impl TurnCoordinator {
    /// Create the coordinator and its drainer. The drainer task starts
    /// immediately and runs until [`EventDrainer::flush`] stops it.
    pub fn new() -> (std::sync::Arc<Self>, EventDrainer) {
        let (tx, mut raw_rx) = mpsc::unbounded_channel::<AgentEvent>();
        let (queued_tx, queued_rx) = mpsc::channel(DRAIN_QUEUE_CAPACITY);
        let stop = CancellationToken::new();
        let drainer_stop = stop.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    item = raw_rx.recv() => match item {
                        Some(event) => {
                            if queued_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = drainer_stop.cancelled() => {
                        // Flush everything already enqueued, then exit.
                        while let Ok(event) = raw_rx.try_recv() {
                            if queued_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                }
            }
        });

        let coordinator = std::sync::Arc::new(Self {
            tx,
            waiters: std::sync::Arc::new(Mutex::new(HashMap::new())),
        });
        let drainer = EventDrainer {
            rx: queued_rx,
            stop,
            handle: Some(handle),
        };
        (coordinator, drainer)
    }

    /// Non-blocking, thread-safe enqueue. Events emitted after the turn's
    /// drainer has shut down are dropped.
    pub fn emit(&self, kind: EventKind) {
        self.emit_event(AgentEvent::now(kind));
    }

    pub fn emit_event(&self, event: AgentEvent) {
        if self.tx.send(event).is_err() {
            trace!("event emitted after turn teardown, dropping");
        }
    }

    /// Route a response to its waiter and echo it into the event stream.
    /// An unknown `request_id` (deadline already expired, or the caller
    /// raced) is a silent no-op.
    pub fn send_response(&self, request_id: &str, kind: EventKind) {
        let waiter = {
            let mut waiters = self.waiters.lock().expect("waiter map poisoned");
            waiters.remove(request_id)
        };
        match waiter {
            Some(sender) => {
                let event = AgentEvent::now(kind);
                self.emit_event(event.clone());
                if sender.send(event).is_err() {
                    trace!(request_id, "waiter dropped before response delivery");
                }
            }
            None => {
                debug!(request_id, "response for unknown request id, dropping");
            }
        }
    }

    /// Register a waiter for `request_id` before emitting the request
    /// event, closing the race where a fast responder replies before the
    /// wait is in place. Await the returned waiter to get the response.
    pub fn register_waiter(&self, request_id: &str) -> ResponseWaiter {
        let (sender, receiver) = oneshot::channel();
        {
            let mut waiters = self.waiters.lock().expect("waiter map poisoned");
            waiters.insert(request_id.to_string(), sender);
        }
        ResponseWaiter {
            request_id: request_id.to_string(),
            receiver,
            waiters: self.waiters.clone(),
        }
    }

    /// Register a waiter for `request_id` and await its response in one
    /// step. Only safe when the responder cannot observe the request before
    /// this call runs; otherwise use [`register_waiter`](Self::register_waiter).
    ///
    /// Fails with `Timeout` when the deadline elapses, `Cancelled` when the
    /// caller cancels (or the turn tears down), and `TypeMismatch` when the
    /// delivered event is not assignable to `T`. A response arriving after
    /// a failure is dropped by [`send_response`](Self::send_response).
    pub async fn wait_for_response<T: FromEventKind>(
        &self,
        request_id: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, CoordinatorError> {
        self.register_waiter(request_id).wait(timeout, cancel).await
    }

    /// Drop all outstanding waiters; their waits resolve with `Cancelled`.
    pub fn shutdown(&self) {
        let mut waiters = self.waiters.lock().expect("waiter map poisoned");
        let outstanding = waiters.len();
        if outstanding > 0 {
            debug!(outstanding, "resolving outstanding waiters on teardown");
        }
        waiters.clear();
    }

    fn remove_waiter(&self, request_id: &str) {
        let mut waiters = self.waiters.lock().expect("waiter map poisoned");
        waiters.remove(request_id);
    }
}

/// A registered single-shot waiter for one response event.
pub struct ResponseWaiter {
    request_id: String,
    receiver: oneshot::Receiver<AgentEvent>,
    waiters: WaiterMap,
}

impl ResponseWaiter {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Await the routed response, racing the deadline and cancellation.
    pub async fn wait<T: FromEventKind>(
        self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<T, CoordinatorError> {
        let ResponseWaiter {
            request_id,
            receiver,
            waiters,
        } = self;

        tokio::select! {
            delivered = receiver => match delivered {
                Ok(event) => T::from_event(event).map_err(|event| {
                    warn!(%request_id, got = event.wire_name(), "response type mismatch");
                    CoordinatorError::TypeMismatch {
                        request_id,
                        got: event.wire_name(),
                    }
                }),
                // Sender dropped without a value: turn teardown.
                Err(_) => Err(CoordinatorError::Cancelled { request_id }),
            },
            _ = tokio::time::sleep(timeout) => {
                waiters.lock().expect("waiter map poisoned").remove(&request_id);
                Err(CoordinatorError::Timeout { request_id })
            }
            _ = cancel.cancelled() => {
                waiters.lock().expect("waiter map poisoned").remove(&request_id);
                Err(CoordinatorError::Cancelled { request_id })
            }
        }
    }
}

/// Consumer side of the turn's event plane. The loop polls
/// [`try_next`](Self::try_next) at safe points or awaits
/// [`recv`](Self::recv) while blocked on other work, and calls
/// [`flush`](Self::flush) exactly once at turn end.
pub struct EventDrainer {
    rx: mpsc::Receiver<AgentEvent>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl EventDrainer {
    /// Pop one queued event without blocking.
    pub fn try_next(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }

    /// Await the next queued event. Returns `None` once the drainer task
    /// has exited and the queue is empty.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    /// Stop the drainer task and return every event that was enqueued
    /// before the stop, in FIFO order. No event is lost or duplicated.
    pub async fn flush(mut self) -> Vec<AgentEvent> {
        self.stop.cancel();
        let handle = self.handle.take();
        let rx = &mut self.rx;
        // Drain concurrently with the join: the drainer may be parked on a
        // full queue and needs the consumer to make room before it can exit.
        let (remaining, _) = tokio::join!(
            async {
                let mut remaining = Vec::new();
                while let Some(event) = rx.recv().await {
                    remaining.push(event);
                }
                remaining
            },
            async {
                if let Some(handle) = handle {
                    if handle.await.is_err() {
                        warn!("event drainer task panicked during flush");
                    }
                }
            }
        );
        remaining
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ContinuationResponse, PermissionRequest, PermissionResponse};

    fn permission_response(request_id: &str, approved: bool) -> EventKind {
        EventKind::PermissionResponse(PermissionResponse {
            request_id: request_id.to_string(),
            approved,
            reason: None,
        })
    }

    #[tokio::test]
    async fn emitted_events_drain_in_fifo_order() {
        let (coordinator, mut drainer) = TurnCoordinator::new();
        for i in 0..5 {
            coordinator.emit(EventKind::StepStarted { index: i });
        }
        let mut seen = Vec::new();
        while seen.len() < 5 {
            if let Some(event) = drainer.recv().await {
                seen.push(event);
            }
        }
        for (i, event) in seen.iter().enumerate() {
            assert_eq!(event.kind, EventKind::StepStarted { index: i });
        }
    }

    #[tokio::test]
    async fn flush_observes_every_enqueued_event_once() {
        let (coordinator, drainer) = TurnCoordinator::new();
        for i in 0..50 {
            coordinator.emit(EventKind::StepFinished { index: i });
        }
        drop(coordinator);
        let events = drainer.flush().await;
        assert_eq!(events.len(), 50);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.kind, EventKind::StepFinished { index: i });
        }
    }

    #[tokio::test]
    async fn response_reaches_typed_waiter() {
        let (coordinator, _drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<PermissionResponse>(
                        "req-1",
                        Duration::from_secs(5),
                        &cancel,
                    )
                    .await
            })
        };

        // Give the waiter a chance to register.
        tokio::task::yield_now().await;
        coordinator.send_response("req-1", permission_response("req-1", true));

        let resp = waiter.await.unwrap().unwrap();
        assert!(resp.approved);
    }

    #[tokio::test]
    async fn response_is_echoed_into_the_stream_only_when_routed() {
        let (coordinator, mut drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<PermissionResponse>(
                        "req-2",
                        Duration::from_secs(5),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        coordinator.send_response("req-2", permission_response("req-2", false));
        // Unknown id: dropped entirely, not echoed.
        coordinator.send_response("nobody-waits", permission_response("nobody-waits", true));

        waiter.await.unwrap().unwrap();
        let echoed = drainer.recv().await.unwrap();
        assert_eq!(echoed.kind.response_request_id(), Some("req-2"));
        assert!(drainer.try_next().is_none());
    }

    #[tokio::test]
    async fn timeout_removes_waiter_and_late_response_is_dropped() {
        let (coordinator, mut drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let err = coordinator
            .wait_for_response::<PermissionResponse>("req-3", Duration::from_millis(20), &cancel)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::Timeout {
                request_id: "req-3".to_string()
            }
        );

        // Late response: no waiter left, silently dropped, nothing echoed.
        coordinator.send_response("req-3", permission_response("req-3", true));
        assert!(drainer.try_next().is_none());
    }

    #[tokio::test]
    async fn cancellation_resolves_wait() {
        let (coordinator, _drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = coordinator
            .wait_for_response::<ContinuationResponse>("req-4", Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn type_mismatch_is_reported() {
        let (coordinator, _drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<ContinuationResponse>(
                        "req-5",
                        Duration::from_secs(5),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        // Deliver a permission response where a continuation response is
        // expected.
        coordinator.send_response("req-5", permission_response("req-5", true));

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::TypeMismatch {
                request_id: "req-5".to_string(),
                got: "permission_response",
            }
        );
    }

    #[tokio::test]
    async fn shutdown_resolves_outstanding_waiters_with_cancelled() {
        let (coordinator, _drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<PermissionResponse>(
                        "req-6",
                        Duration::from_secs(30),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;

        coordinator.shutdown();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinatorError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn request_event_flows_before_routed_response() {
        let (coordinator, mut drainer) = TurnCoordinator::new();
        let cancel = CancellationToken::new();

        coordinator.emit(EventKind::PermissionRequest(PermissionRequest {
            request_id: "req-7".to_string(),
            call_id: "c1".to_string(),
            tool_name: "label".to_string(),
            arguments: serde_json::json!({}),
        }));
        let waiter = {
            let coordinator = coordinator.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_response::<PermissionResponse>(
                        "req-7",
                        Duration::from_secs(5),
                        &cancel,
                    )
                    .await
            })
        };
        tokio::task::yield_now().await;
        coordinator.send_response("req-7", permission_response("req-7", true));
        waiter.await.unwrap().unwrap();
        drop(coordinator);

        let events = drainer.flush().await;
        let request_idx = events
            .iter()
            .position(|e| e.kind.request_id() == Some("req-7"))
            .unwrap();
        let response_idx = events
            .iter()
            .position(|e| e.kind.response_request_id() == Some("req-7"))
            .unwrap();
        assert!(request_idx < response_idx);
    }
}
