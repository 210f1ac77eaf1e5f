use chrono::{DateTime, Utc};
use serde::Serialize;

use murmur_core::{OutboundEvent, RequestId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TranscriptEntry {
    pub request_id: RequestId,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    /// False while assistant tokens are still arriving.
    pub complete: bool,
}

/// Conversation history built from the server's event stream.
///
/// The server does not echo request ids, so events are attributed to the one
/// request currently awaiting its terminal event. Assistant text accumulates
/// in the entry keyed by that request's id.
#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    pending: Option<RequestId>,
    last_error: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a user message and make it the pending request.
    pub fn begin(&mut self, text: impl Into<String>) -> RequestId {
        if let Some(previous) = self.pending.take() {
            tracing::debug!(request_id = %previous, "superseding unfinished request");
            self.finish_assistant(&previous);
        }

        let request_id = RequestId::new();
        self.entries.push(TranscriptEntry {
            request_id: request_id.clone(),
            role: Role::User,
            content: text.into(),
            timestamp: Utc::now(),
            complete: true,
        });
        self.pending = Some(request_id.clone());
        self.last_error = None;
        request_id
    }

    /// Fold one server event into the pending request. Returns the request
    /// it was attributed to, or `None` when nothing was waiting.
    pub fn apply(&mut self, event: &OutboundEvent) -> Option<RequestId> {
        let Some(request_id) = self.pending.clone() else {
            tracing::debug!(kind = event.kind(), "event with no pending request");
            return None;
        };

        match event {
            OutboundEvent::Token { value } => {
                self.assistant_entry(&request_id).content.push_str(value);
            }
            OutboundEvent::Done => {
                self.finish_assistant(&request_id);
                self.pending = None;
            }
            OutboundEvent::Error { message } => {
                self.finish_assistant(&request_id);
                self.push_error(&request_id, message);
                self.pending = None;
            }
        }
        Some(request_id)
    }

    /// The connection dropped: stop waiting and keep any partial answer.
    pub fn abort(&mut self, message: &str) -> bool {
        let Some(request_id) = self.pending.take() else {
            return false;
        };
        self.finish_assistant(&request_id);
        self.push_error(&request_id, message);
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.pending = None;
        self.last_error = None;
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn is_loading(&self) -> bool {
        self.pending.is_some()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Assistant text accumulated so far for `request_id`.
    pub fn response(&self, request_id: &RequestId) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.role == Role::Assistant && &e.request_id == request_id)
            .map(|e| e.content.as_str())
    }

    fn assistant_entry(&mut self, request_id: &RequestId) -> &mut TranscriptEntry {
        let index = match self
            .entries
            .iter()
            .position(|e| e.role == Role::Assistant && &e.request_id == request_id && !e.complete)
        {
            Some(index) => index,
            None => {
                self.entries.push(TranscriptEntry {
                    request_id: request_id.clone(),
                    role: Role::Assistant,
                    content: String::new(),
                    timestamp: Utc::now(),
                    complete: false,
                });
                self.entries.len() - 1
            }
        };
        &mut self.entries[index]
    }

    fn finish_assistant(&mut self, request_id: &RequestId) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.role == Role::Assistant && &e.request_id == request_id && !e.complete)
        {
            entry.complete = true;
        }
    }

    fn push_error(&mut self, request_id: &RequestId, message: &str) {
        self.entries.push(TranscriptEntry {
            request_id: request_id.clone(),
            role: Role::Assistant,
            content: format!("[Error] {message}"),
            timestamp: Utc::now(),
            complete: true,
        });
        self.last_error = Some(message.to_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_accumulate_into_one_entry() {
        let mut transcript = Transcript::new();
        let id = transcript.begin("hello");
        assert!(transcript.is_loading());

        for t in ["Hel", "lo", "!"] {
            assert_eq!(transcript.apply(&OutboundEvent::token(t)), Some(id.clone()));
        }
        assert_eq!(transcript.response(&id), Some("Hello!"));
        assert!(!transcript.entries()[1].complete);

        transcript.apply(&OutboundEvent::Done);
        assert!(!transcript.is_loading());
        assert_eq!(transcript.entries().len(), 2);
        assert_eq!(transcript.entries()[0].role, Role::User);
        assert_eq!(transcript.entries()[0].content, "hello");
        assert!(transcript.entries()[1].complete);
    }

    #[test]
    fn error_appends_marked_entry() {
        let mut transcript = Transcript::new();
        let id = transcript.begin("hi");
        transcript.apply(&OutboundEvent::token("par"));
        transcript.apply(&OutboundEvent::error("Failed to process message"));

        let last = transcript.entries().last().unwrap();
        assert_eq!(last.content, "[Error] Failed to process message");
        assert_eq!(last.request_id, id);
        assert_eq!(transcript.last_error(), Some("Failed to process message"));
        assert_eq!(transcript.response(&id), Some("par"));
        assert!(!transcript.is_loading());
    }

    #[test]
    fn requests_are_kept_apart() {
        let mut transcript = Transcript::new();
        let first = transcript.begin("one");
        transcript.apply(&OutboundEvent::token("a"));
        transcript.apply(&OutboundEvent::Done);
        let second = transcript.begin("two");
        transcript.apply(&OutboundEvent::token("b"));
        transcript.apply(&OutboundEvent::Done);

        assert_ne!(first, second);
        assert_eq!(transcript.response(&first), Some("a"));
        assert_eq!(transcript.response(&second), Some("b"));
    }

    #[test]
    fn events_without_pending_request_are_ignored() {
        let mut transcript = Transcript::new();
        assert_eq!(transcript.apply(&OutboundEvent::token("stray")), None);
        assert!(transcript.entries().is_empty());
    }

    #[test]
    fn new_request_clears_last_error() {
        let mut transcript = Transcript::new();
        transcript.begin("x");
        transcript.apply(&OutboundEvent::error("boom"));
        transcript.begin("y");
        assert_eq!(transcript.last_error(), None);
    }

    #[test]
    fn abort_keeps_partial_answer() {
        let mut transcript = Transcript::new();
        let id = transcript.begin("x");
        transcript.apply(&OutboundEvent::token("half"));
        assert!(transcript.abort("Connection lost"));
        assert!(!transcript.abort("Connection lost"));

        assert_eq!(transcript.response(&id), Some("half"));
        assert_eq!(transcript.entries().last().unwrap().content, "[Error] Connection lost");
        assert!(transcript.entries().iter().all(|e| e.complete));
    }

    #[test]
    fn clear_resets_everything() {
        let mut transcript = Transcript::new();
        transcript.begin("x");
        transcript.apply(&OutboundEvent::error("e"));
        transcript.clear();
        assert!(transcript.entries().is_empty());
        assert!(!transcript.is_loading());
        assert_eq!(transcript.last_error(), None);
    }

    #[test]
    fn timestamps_are_ordered() {
        let mut transcript = Transcript::new();
        transcript.begin("x");
        transcript.apply(&OutboundEvent::token("y"));
        let entries = transcript.entries();
        assert!(entries[0].timestamp <= entries[1].timestamp);
    }
}
