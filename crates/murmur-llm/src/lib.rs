pub mod config;
pub mod demo;
pub mod mock;
pub mod provider;
pub mod sse;

use std::sync::Arc;

use murmur_core::CompletionClient;

pub use config::CompletionConfig;
pub use demo::DemoClient;
pub use mock::{ScriptedClient, ScriptedResponse};
pub use provider::OpenAiCompatClient;

/// Pick the completion backend once, at startup.
///
/// A missing or placeholder credential selects the demo generator for the
/// lifetime of the process; there is no per-request fallback.
pub fn build_client(config: &CompletionConfig) -> Arc<dyn CompletionClient> {
    match config.credential() {
        Some(key) => {
            tracing::info!(base_url = %config.base_url, model = %config.model, "using live completion provider");
            Arc::new(OpenAiCompatClient::new(key, config))
        }
        None => {
            tracing::warn!("no valid OPENAI_API_KEY configured; running in DEMO MODE with canned responses");
            Arc::new(DemoClient::new(config.demo_char_delay))
        }
    }
}
