use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;

use murmur_core::{OutboundEvent, SessionId};
use murmur_telemetry::MetricsRecorder;

use crate::session::{Inbound, SessionEvent};

pub const REQUESTS_TOTAL: &str = "relay.requests.total";
pub const TOKENS_TOTAL: &str = "relay.tokens.total";
pub const ERRORS_TOTAL: &str = "relay.errors.total";
pub const REQUEST_DURATION_MS: &str = "relay.request.duration_ms";
pub const SESSIONS_ACTIVE: &str = "ws.sessions.active";

/// Records relay metrics from a session's event tap.
pub struct MetricsObserver {
    session_id: SessionId,
    recorder: Arc<MetricsRecorder>,
    mode: &'static str,
    // Start times of inbound frames still awaiting their terminal event.
    started: VecDeque<Instant>,
}

impl MetricsObserver {
    pub fn new(session_id: SessionId, recorder: Arc<MetricsRecorder>, mode: &'static str) -> Self {
        Self {
            session_id,
            recorder,
            mode,
            started: VecDeque::new(),
        }
    }

    pub fn observe(&mut self, event: &SessionEvent) {
        let labels = [("mode", self.mode)];
        match event {
            SessionEvent::Inbound(inbound) => {
                if matches!(inbound, Inbound::Request(_)) {
                    self.recorder.counter_inc(REQUESTS_TOTAL, &labels, 1);
                }
                self.started.push_back(Instant::now());
            }
            SessionEvent::Outbound(OutboundEvent::Token { .. }) => {
                self.recorder.counter_inc(TOKENS_TOTAL, &labels, 1);
            }
            SessionEvent::Outbound(terminal) => {
                if matches!(terminal, OutboundEvent::Error { .. }) {
                    self.recorder.counter_inc(ERRORS_TOTAL, &labels, 1);
                }
                if let Some(start) = self.started.pop_front() {
                    let elapsed_ms = start.elapsed().as_secs_f64() * 1000.0;
                    self.recorder
                        .histogram_observe(REQUEST_DURATION_MS, &[("outcome", terminal.kind())], elapsed_ms);
                }
            }
            SessionEvent::State(_) => {}
        }
    }

    /// Consume the tap until the session goes away.
    pub fn spawn(mut self, mut rx: broadcast::Receiver<SessionEvent>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => self.observe(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(session_id = %self.session_id, skipped = n, "metrics observer lagged, dropped events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

/// Emits a debug line for every tap event.
pub fn spawn_log_observer(
    session_id: SessionId,
    mut rx: broadcast::Receiver<SessionEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(SessionEvent::Inbound(Inbound::Request(request))) => {
                    tracing::debug!(session_id = %session_id, chars = request.text.chars().count(), "inbound request");
                }
                Ok(SessionEvent::Inbound(Inbound::Malformed { detail })) => {
                    tracing::debug!(session_id = %session_id, %detail, "inbound malformed frame");
                }
                Ok(SessionEvent::Inbound(Inbound::Rejected)) => {
                    tracing::debug!(session_id = %session_id, "inbound frame rejected");
                }
                Ok(SessionEvent::Outbound(event)) if event.is_terminal() => {
                    tracing::debug!(session_id = %session_id, kind = event.kind(), "outbound terminal event");
                }
                Ok(SessionEvent::Outbound(_)) => {}
                Ok(SessionEvent::State(state)) => {
                    tracing::debug!(session_id = %session_id, %state, "session state changed");
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::trace!(session_id = %session_id, skipped = n, "log observer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
