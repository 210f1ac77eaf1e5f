use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use murmur_core::{CloseReason, InboundRequest, OutboundEvent, SessionId, SessionState};

const TAP_CAPACITY: usize = 256;

/// One inbound frame, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    Request(InboundRequest),
    /// A text frame that did not parse; answered with an error event.
    Malformed { detail: String },
    /// Stand-in for a frame that arrived while the queue was full; answered
    /// with a busy error in its place.
    Rejected,
}

/// Receiving half of a session's inbound queue.
pub struct InboundQueue {
    rx: mpsc::UnboundedReceiver<Inbound>,
    depth: Arc<AtomicUsize>,
}

impl InboundQueue {
    /// Next frame in arrival order. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Inbound> {
        let frame = self.rx.recv().await?;
        if frame != Inbound::Rejected {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
        Some(frame)
    }
}

/// Observation tap for logging and metrics. Never drives behavior.
#[derive(Clone, Debug)]
pub enum SessionEvent {
    Inbound(Inbound),
    Outbound(OutboundEvent),
    State(SessionState),
}

/// Server side of one client connection.
///
/// Business logic talks to the socket only through this type: the relay
/// consumes [`take_inbound`](Self::take_inbound) and writes with
/// [`send`](Self::send); the socket driver feeds frames in with
/// [`deliver_inbound`](Self::deliver_inbound) and drains the outbound queue.
pub struct TransportSession {
    id: SessionId,
    state: Mutex<SessionState>,
    close_reason: Mutex<Option<CloseReason>>,
    outbound_tx: mpsc::Sender<String>,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: Mutex<Option<InboundQueue>>,
    inbound_depth: Arc<AtomicUsize>,
    inbound_capacity: usize,
    tap: broadcast::Sender<SessionEvent>,
    cancel: CancellationToken,
    in_flight: AtomicBool,
}

impl TransportSession {
    /// Create a session in `connecting` state. The receiver is the outbound
    /// queue the socket writer drains.
    pub fn new(max_send_queue: usize, inbound_queue: usize) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (outbound_tx, outbound_rx) = mpsc::channel(max_send_queue.max(1));
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let inbound_depth = Arc::new(AtomicUsize::new(0));
        let (tap, _) = broadcast::channel(TAP_CAPACITY);

        let session = Arc::new(Self {
            id: SessionId::new(),
            state: Mutex::new(SessionState::Connecting),
            close_reason: Mutex::new(None),
            outbound_tx,
            inbound_tx,
            inbound_rx: Mutex::new(Some(InboundQueue {
                rx: inbound_rx,
                depth: Arc::clone(&inbound_depth),
            })),
            inbound_depth,
            inbound_capacity: inbound_queue.max(1),
            tap,
            cancel: CancellationToken::new(),
            in_flight: AtomicBool::new(false),
        });
        (session, outbound_rx)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn is_open(&self) -> bool {
        self.state().is_open()
    }

    /// Whether a completion request is currently being relayed.
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Relaxed)
    }

    pub fn set_in_flight(&self, value: bool) {
        self.in_flight.store(value, Ordering::Relaxed);
    }

    /// Cancelled once the session starts closing or errors.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Reason recorded by [`close`](Self::close) or a peer close frame.
    pub fn close_reason(&self) -> Option<CloseReason> {
        *self.close_reason.lock()
    }

    /// Attempt a state transition. Invalid transitions are rejected and logged.
    fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition_to(next) {
            let from = *state;
            tracing::debug!(session_id = %self.id, %from, to = %next, "rejected session transition");
            return false;
        }
        *state = next;
        drop(state);
        let _ = self.tap.send(SessionEvent::State(next));
        true
    }

    /// Mark the duplex channel as established.
    pub fn open(&self) -> bool {
        let opened = self.transition(SessionState::Open);
        if opened {
            tracing::info!(session_id = %self.id, "session open");
        }
        opened
    }

    /// Write one event to the client.
    ///
    /// Waits for room in the outbound queue. Returns `false` without
    /// propagating anything when the session is not open or goes away while
    /// waiting.
    pub async fn send(&self, event: OutboundEvent) -> bool {
        if !self.is_open() {
            tracing::debug!(session_id = %self.id, kind = event.kind(), state = %self.state(), "dropping event for session that is not open");
            return false;
        }

        let json = match event.to_json() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to serialize outbound event");
                return false;
            }
        };

        let sent = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => false,
            res = self.outbound_tx.send(json) => res.is_ok(),
        };

        if sent {
            let _ = self.tap.send(SessionEvent::Outbound(event));
        } else {
            tracing::debug!(session_id = %self.id, kind = event.kind(), "outbound queue closed");
        }
        sent
    }

    /// Enqueue one inbound frame for the relay.
    ///
    /// At most `inbound_queue` frames wait at once. A frame past that is
    /// replaced by [`Inbound::Rejected`], so it still gets exactly one error
    /// event, in arrival order. Returns whether the frame itself was queued.
    /// Only the socket reader calls this.
    pub fn deliver_inbound(&self, inbound: Inbound) -> bool {
        let accepted = self.inbound_depth.load(Ordering::SeqCst) < self.inbound_capacity;
        let frame = if accepted {
            self.inbound_depth.fetch_add(1, Ordering::SeqCst);
            inbound
        } else {
            tracing::warn!(session_id = %self.id, "inbound queue full, rejecting request");
            Inbound::Rejected
        };

        match self.inbound_tx.send(frame.clone()) {
            Ok(()) => {
                let _ = self.tap.send(SessionEvent::Inbound(frame));
                accepted
            }
            Err(_) => {
                if accepted {
                    self.inbound_depth.fetch_sub(1, Ordering::SeqCst);
                }
                tracing::debug!(session_id = %self.id, "inbound queue closed");
                false
            }
        }
    }

    /// Hand the ordered inbound stream to its single consumer. Subsequent
    /// calls return `None`.
    pub fn take_inbound(&self) -> Option<InboundQueue> {
        self.inbound_rx.lock().take()
    }

    /// Observe inbound and outbound traffic plus state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tap.subscribe()
    }

    /// Begin a graceful close. The socket writer sends the close frame and
    /// completes the transition to `closed`.
    pub fn close(&self, reason: CloseReason) -> bool {
        if !self.transition(SessionState::Closing) {
            return false;
        }
        *self.close_reason.lock() = Some(reason);
        tracing::info!(session_id = %self.id, code = reason.code(), "closing session");
        self.cancel.cancel();
        true
    }

    /// Called once our close frame has been written.
    pub fn mark_closed(&self) {
        let reason = self.close_reason().unwrap_or(CloseReason::Normal);
        self.transition(SessionState::Closed(reason));
    }

    /// The peer sent a close frame or ended the stream.
    pub fn on_peer_close(&self, reason: CloseReason) {
        {
            let mut recorded = self.close_reason.lock();
            if recorded.is_none() {
                *recorded = Some(reason);
            }
        }
        match self.state() {
            SessionState::Open => {
                self.transition(SessionState::Closing);
                self.mark_closed();
            }
            SessionState::Closing => self.mark_closed(),
            SessionState::Connecting => {
                self.transition(SessionState::Errored);
            }
            SessionState::Closed(_) | SessionState::Errored => {}
        }
        self.cancel.cancel();
    }

    /// A transport failure. Not reported to the client.
    pub fn fail(&self, error: &str) {
        if self.transition(SessionState::Errored) {
            tracing::warn!(session_id = %self.id, error, "session transport error");
        }
        self.cancel.cancel();
    }
}
