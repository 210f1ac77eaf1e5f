use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

pub const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";
pub const DEFAULT_MODEL: &str = "openai/gpt-3.5-turbo";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEMO_CHAR_DELAY: Duration = Duration::from_millis(20);

/// Placeholder some setups ship in `.env` templates; never a real key.
const PLACEHOLDER_KEY: &str = "sk-dummy";

/// Upstream settings, read once at process start.
#[derive(Clone, Debug)]
pub struct CompletionConfig {
    pub api_key: Option<SecretString>,
    pub base_url: String,
    pub model: String,
    /// Bound on waiting for the provider's response headers.
    pub request_timeout: Duration,
    /// Bound on the gap between two chunks of the response body.
    pub idle_timeout: Duration,
    /// Pause between characters of a demo response.
    pub demo_char_delay: Duration,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: DEFAULT_BASE_URL.into(),
            model: DEFAULT_MODEL.into(),
            request_timeout: REQUEST_TIMEOUT,
            idle_timeout: IDLE_TIMEOUT,
            demo_char_delay: DEMO_CHAR_DELAY,
        }
    }
}

impl CompletionConfig {
    /// The configured key, if it looks usable.
    pub fn credential(&self) -> Option<&SecretString> {
        self.api_key.as_ref().filter(|k| is_valid_credential(k.expose_secret()))
    }

    pub fn has_valid_credential(&self) -> bool {
        self.credential().is_some()
    }
}

/// A key is usable when it is non-empty, not the placeholder, and `sk-` prefixed.
pub fn is_valid_credential(key: &str) -> bool {
    let key = key.trim();
    !key.is_empty() && key != PLACEHOLDER_KEY && key.starts_with("sk-")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = CompletionConfig::default();
        assert!(config.api_key.is_none());
        assert_eq!(config.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.model, "openai/gpt-3.5-turbo");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.demo_char_delay, Duration::from_millis(20));
        assert!(!config.has_valid_credential());
    }

    #[test]
    fn credential_validity() {
        assert!(is_valid_credential("sk-proj-123"));
        assert!(is_valid_credential("sk-or-v1-abc"));
        assert!(!is_valid_credential(""));
        assert!(!is_valid_credential("   "));
        assert!(!is_valid_credential("sk-dummy"));
        assert!(!is_valid_credential("pk-live-123"));
    }

    #[test]
    fn credential_filters_invalid_key() {
        let config = CompletionConfig {
            api_key: Some(SecretString::from("not-a-key")),
            ..Default::default()
        };
        assert!(config.credential().is_none());

        let config = CompletionConfig {
            api_key: Some(SecretString::from("sk-real")),
            ..Default::default()
        };
        assert_eq!(config.credential().unwrap().expose_secret(), "sk-real");
    }

    #[test]
    fn debug_output_redacts_key() {
        let config = CompletionConfig {
            api_key: Some(SecretString::from("sk-very-secret")),
            ..Default::default()
        };
        assert!(!format!("{config:?}").contains("sk-very-secret"));
    }
}
