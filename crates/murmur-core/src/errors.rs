/// Classified failure of an upstream completion call.
///
/// Every variant maps to a distinct user-facing message via
/// [`CompletionError::user_message`]; the inner string is the provider's own
/// detail and is only ever logged.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CompletionError {
    /// Invalid or missing credential.
    #[error("authentication failed: {0}")]
    Auth(String),
    /// Rate limit or billing exhaustion.
    #[error("quota exhausted: {0}")]
    Quota(String),
    /// Provider unreachable, connection refused, or timed out.
    #[error("network error: {0}")]
    Network(String),
    /// Any other provider-reported failure.
    #[error("provider error: {0}")]
    Provider(String),
}

impl CompletionError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::Quota(_) => "quota",
            Self::Network(_) => "network",
            Self::Provider(_) => "provider",
        }
    }

    /// The message sent to the client in the terminal `error` event.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Auth(_) => "Invalid API key. Please check your OPENAI_API_KEY setting.",
            Self::Quota(_) => "API quota exceeded. Please check your provider account billing.",
            Self::Network(_) => {
                "Cannot connect to the completion provider. Please try again later."
            }
            Self::Provider(_) => "Failed to process message",
        }
    }

    /// Classify an HTTP status code (plus response body) into a variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Auth(body),
            402 | 429 => Self::Quota(body),
            _ if body.contains("insufficient_quota") => Self::Quota(body),
            _ => Self::Provider(format!("status {status}: {body}")),
        }
    }
}
