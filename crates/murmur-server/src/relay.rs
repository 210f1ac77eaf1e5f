use std::sync::Arc;

use futures::StreamExt;
use tracing::instrument;

use murmur_core::{CompletionClient, InboundRequest, OutboundEvent};

use crate::error::RelayError;
use crate::session::{Inbound, TransportSession};

/// How one inbound frame was resolved.
#[derive(Debug, PartialEq, Eq)]
pub enum RelayOutcome {
    /// `fragments` tokens followed by `done`.
    Completed { fragments: usize },
    /// A single `error` event was sent; `kind` is the error classification.
    Failed { kind: &'static str },
    /// The session stopped accepting events before a terminal event went out.
    Abandoned,
}

/// Per-connection coordinator between a session and the completion backend.
#[derive(Clone)]
pub struct Relay {
    client: Arc<dyn CompletionClient>,
}

impl Relay {
    pub fn new(client: Arc<dyn CompletionClient>) -> Self {
        Self { client }
    }

    pub fn is_demo(&self) -> bool {
        self.client.is_demo()
    }

    /// Serve a session's inbound stream until it closes.
    ///
    /// Frames are handled strictly one after another, so a session never has
    /// two upstream calls in flight.
    pub async fn run(&self, session: Arc<TransportSession>) {
        let Some(mut inbound) = session.take_inbound() else {
            tracing::warn!(session_id = %session.id(), "inbound stream already taken");
            return;
        };
        let cancel = session.cancellation();

        loop {
            let frame = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                frame = inbound.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
            };

            let outcome = tokio::select! {
                biased;
                // Dropping the in-progress future drops the fragment stream.
                _ = cancel.cancelled() => {
                    tracing::info!(session_id = %session.id(), "session closed mid-request, abandoning completion");
                    RelayOutcome::Abandoned
                }
                outcome = self.handle(&session, frame) => outcome,
            };
            session.set_in_flight(false);

            if outcome == RelayOutcome::Abandoned {
                break;
            }
        }

        tracing::debug!(session_id = %session.id(), "relay stopped");
    }

    /// Resolve one inbound frame into `token* (done | error)`.
    pub async fn handle(&self, session: &TransportSession, frame: Inbound) -> RelayOutcome {
        match frame {
            Inbound::Malformed { detail } => {
                tracing::warn!(session_id = %session.id(), error = %detail, "malformed inbound frame");
                self.fail(session, RelayError::Parse(detail)).await
            }
            Inbound::Request(request) => self.relay_request(session, request).await,
            Inbound::Rejected => self.fail(session, RelayError::Busy).await,
        }
    }

    #[instrument(skip_all, fields(session_id = %session.id(), chars = request.text.chars().count()))]
    async fn relay_request(&self, session: &TransportSession, request: InboundRequest) -> RelayOutcome {
        if request.is_blank() {
            return self.fail(session, RelayError::Validation).await;
        }

        session.set_in_flight(true);
        let outcome = self.stream_completion(session, &request.text).await;
        session.set_in_flight(false);
        outcome
    }

    async fn stream_completion(&self, session: &TransportSession, prompt: &str) -> RelayOutcome {
        let mut stream = match self.client.complete(prompt).await {
            Ok(stream) => stream,
            Err(e) => return self.fail(session, e.into()).await,
        };

        let mut fragments = 0usize;
        while let Some(item) = stream.next().await {
            match item {
                Ok(fragment) if fragment.is_empty() => {}
                Ok(fragment) => {
                    if !session.send(OutboundEvent::token(fragment)).await {
                        return RelayOutcome::Abandoned;
                    }
                    fragments += 1;
                }
                Err(e) => {
                    drop(stream);
                    tracing::warn!(fragments, "completion failed mid-stream");
                    return self.fail(session, e.into()).await;
                }
            }
        }

        if !session.send(OutboundEvent::Done).await {
            return RelayOutcome::Abandoned;
        }
        tracing::debug!(fragments, "completion relayed");
        RelayOutcome::Completed { fragments }
    }

    async fn fail(&self, session: &TransportSession, error: RelayError) -> RelayOutcome {
        let kind = error.error_kind();
        tracing::warn!(session_id = %session.id(), kind, error = %error, "request failed");

        let Some(message) = error.user_message() else {
            return RelayOutcome::Abandoned;
        };
        if session.send(OutboundEvent::error(message)).await {
            RelayOutcome::Failed { kind }
        } else {
            RelayOutcome::Abandoned
        }
    }
}
