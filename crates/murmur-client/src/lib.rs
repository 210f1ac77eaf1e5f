//! Client side of the chat relay: a reconnecting WebSocket connection and
//! the transcript a renderer reads from.
//!
//! ```text
//! ChatConnection::connect(config)
//!   └─ spawns driver task
//!        ├── ChatHandle ──► mpsc ──► driver   (send, close)
//!        └── ChatEvents ◄── mpsc ◄── driver   (status, server events, retries)
//! ```

pub mod config;
pub mod connection;
pub mod error;
pub mod reconnect;
pub mod transcript;

pub use config::{ClientConfig, ReconnectConfig};
pub use connection::{ChatConnection, ChatEvents, ChatHandle, ClientEvent, ConnectionStatus};
pub use error::ClientError;
pub use reconnect::{ReconnectDecision, ReconnectPolicy};
pub use transcript::{Role, Transcript, TranscriptEntry};
