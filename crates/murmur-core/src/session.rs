use serde::{Deserialize, Serialize};

/// WebSocket close code for an intentional shutdown.
pub const CLOSE_NORMAL: u16 = 1000;
/// WebSocket close code used when the server tears a session down on error.
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;

/// Why a connection was closed. Only `Normal` suppresses reconnection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Normal,
    Abnormal,
}

impl CloseReason {
    pub fn code(self) -> u16 {
        match self {
            Self::Normal => CLOSE_NORMAL,
            Self::Abnormal => CLOSE_INTERNAL_ERROR,
        }
    }

    /// Any code other than 1000 counts as abnormal, as does a missing close frame.
    pub fn from_code(code: Option<u16>) -> Self {
        match code {
            Some(CLOSE_NORMAL) => Self::Normal,
            _ => Self::Abnormal,
        }
    }
}

/// Lifecycle of one duplex connection.
///
/// ```text
/// connecting → open → closing → closed
///      │         │       │
///      └─────────┴───────┴──→ errored
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed(CloseReason),
    Errored,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Open => "open",
            Self::Closing => "closing",
            Self::Closed(_) => "closed",
            Self::Errored => "errored",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed(_) | Self::Errored)
    }

    /// Whether the client side may attempt to reattach from this state.
    pub fn allows_reconnect(&self) -> bool {
        matches!(self, Self::Errored | Self::Closed(CloseReason::Abnormal))
    }

    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Open)
                | (Connecting, Errored)
                | (Open, Closing)
                | (Open, Errored)
                | (Closing, Closed(_))
                | (Closing, Errored)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
