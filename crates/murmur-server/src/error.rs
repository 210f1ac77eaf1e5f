use murmur_core::CompletionError;

/// Everything that can go wrong while serving one request.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("empty message")]
    Validation,
    #[error("malformed request: {0}")]
    Parse(String),
    /// The session's inbound queue was full when the request arrived.
    #[error("inbound queue full")]
    Busy,
    #[error(transparent)]
    Completion(#[from] CompletionError),
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Parse(_) => "parse",
            Self::Busy => "busy",
            Self::Completion(e) => e.error_kind(),
            Self::Transport(_) => "transport",
        }
    }

    /// Text of the `error` event sent to the client. Transport failures are
    /// never reported over the transport that failed.
    pub fn user_message(&self) -> Option<String> {
        match self {
            Self::Validation => Some("Message cannot be empty".into()),
            Self::Parse(detail) => Some(format!("Failed to process message: {detail}")),
            Self::Busy => Some("Server busy, request dropped".into()),
            Self::Completion(e) => Some(e.user_message().into()),
            Self::Transport(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages() {
        assert_eq!(RelayError::Validation.user_message().unwrap(), "Message cannot be empty");
        assert_eq!(
            RelayError::Parse("expected value at line 1 column 1".into()).user_message().unwrap(),
            "Failed to process message: expected value at line 1 column 1"
        );
        assert_eq!(
            RelayError::from(CompletionError::Quota("429".into())).user_message().unwrap(),
            "API quota exceeded. Please check your provider account billing."
        );
        assert_eq!(RelayError::Busy.user_message().unwrap(), "Server busy, request dropped");
        assert!(RelayError::Transport("reset".into()).user_message().is_none());
    }

    #[test]
    fn kinds() {
        assert_eq!(RelayError::Validation.error_kind(), "validation");
        assert_eq!(RelayError::from(CompletionError::Auth(String::new())).error_kind(), "auth");
    }
}
