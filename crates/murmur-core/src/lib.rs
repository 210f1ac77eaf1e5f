pub mod completion;
pub mod errors;
pub mod ids;
pub mod session;
pub mod wire;

pub use completion::{CompletionClient, FragmentStream};
pub use errors::CompletionError;
pub use ids::{RequestId, SessionId};
pub use session::{CloseReason, SessionState};
pub use wire::{InboundRequest, OutboundEvent};
