use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::errors::CompletionError;

/// Lazy, finite sequence of text fragments produced by one completion call.
///
/// An `Err` item is terminal: implementations yield nothing after it.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

/// Trait implemented by every upstream completion backend (live provider or
/// the local demo generator).
#[async_trait]
pub trait CompletionClient: Send + Sync {
    fn name(&self) -> &str;
    fn model(&self) -> &str;

    /// True for the local fallback generator.
    fn is_demo(&self) -> bool {
        false
    }

    /// Issue one streaming request for `prompt`.
    ///
    /// Errors that happen before the first fragment are returned here; errors
    /// after that arrive as an `Err` item on the stream.
    async fn complete(&self, prompt: &str) -> Result<FragmentStream, CompletionError>;
}
