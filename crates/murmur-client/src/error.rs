#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("not connected")]
    NotConnected,
    /// The previous request has not reached `done` or `error` yet.
    #[error("a request is already in progress")]
    Busy,
    #[error("connection task has stopped")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
