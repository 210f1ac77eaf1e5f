pub mod config;
pub mod error;
pub mod observer;
pub mod registry;
pub mod relay;
pub mod server;
pub mod session;
pub mod socket;

pub use config::ServerConfig;
pub use error::RelayError;
pub use registry::SessionRegistry;
pub use relay::{Relay, RelayOutcome};
pub use server::{build_router, start, AppState, ServerHandle};
pub use session::{Inbound, InboundQueue, SessionEvent, TransportSession};
