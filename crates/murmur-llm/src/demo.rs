//! Canned responses for running without an upstream credential.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream;

use murmur_core::{CompletionClient, CompletionError, FragmentStream};

/// Ordered keyword table. The first keyword found anywhere in the
/// lowercased request wins, so "this" matches `hi` before `test`.
const RESPONSES: &[(&str, &str)] = &[
    (
        "hello",
        "Hello! I'm a demo AI assistant. Since we're in demo mode, I can't connect to the actual OpenAI API. But I can show you how the chat interface works!",
    ),
    (
        "hi",
        "Hey there! Welcome to the Realtime AI Chatbot demo. This is a mock response to demonstrate the interface.",
    ),
    (
        "how",
        "I'm doing great, thanks for asking! In demo mode, I generate simple responses to show how the real chatbot would work.",
    ),
    (
        "test",
        "This is a test message. In production mode with a valid OpenAI API key, you'd get AI-powered responses.",
    ),
    (
        "help",
        "I can help with general conversation in demo mode. Try asking me anything and I'll respond with a demo message.",
    ),
];

const DEFAULT_RESPONSE: &str = "Thanks for your message! This is a demo response. To use real AI responses, please add a valid OpenAI API key to your .env file.";

/// Select the canned reply for a request. Deterministic.
pub fn demo_response(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    RESPONSES
        .iter()
        .find(|(keyword, _)| lowered.contains(keyword))
        .map_or(DEFAULT_RESPONSE, |(_, response)| response)
}

/// Streams a canned reply one character per fragment.
pub struct DemoClient {
    char_delay: Duration,
}

impl DemoClient {
    pub fn new(char_delay: Duration) -> Self {
        Self { char_delay }
    }
}

#[async_trait]
impl CompletionClient for DemoClient {
    fn name(&self) -> &str {
        "demo"
    }

    fn model(&self) -> &str {
        "demo"
    }

    fn is_demo(&self) -> bool {
        true
    }

    async fn complete(&self, prompt: &str) -> Result<FragmentStream, CompletionError> {
        let response = demo_response(prompt);
        tracing::debug!(chars = response.chars().count(), "streaming demo response");

        let delay = self.char_delay;
        let chars = response.chars();
        let fragments = stream::unfold((chars, true), move |(mut chars, first)| async move {
            let c = chars.next()?;
            if !first && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            Some((Ok::<_, CompletionError>(c.to_string()), (chars, false)))
        });

        Ok(Box::pin(fragments))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn keyword_selection() {
        assert!(demo_response("hello there").starts_with("Hello! I'm a demo AI assistant."));
        assert!(demo_response("Hi").starts_with("Hey there!"));
        assert!(demo_response("HOW are you").starts_with("I'm doing great"));
        assert!(demo_response("run a test").starts_with("This is a test message."));
        assert!(demo_response("help me").starts_with("I can help"));
        assert_eq!(demo_response("What's the weather?"), DEFAULT_RESPONSE);
        assert_eq!(demo_response(""), DEFAULT_RESPONSE);
    }

    #[test]
    fn first_match_in_table_order_wins() {
        // Contains both "hello" and "help"; "hello" is listed first.
        assert!(demo_response("hello, help").starts_with("Hello!"));
        // "this" contains "hi", which outranks "test".
        assert!(demo_response("this is a test").starts_with("Hey there!"));
    }

    #[test]
    fn deterministic() {
        assert_eq!(demo_response("hello"), demo_response("hello"));
    }

    #[tokio::test]
    async fn streams_one_character_per_fragment() {
        let client = DemoClient::new(Duration::ZERO);
        let stream = client.complete("What's the weather?").await.unwrap();
        let fragments: Vec<String> = stream.map(|r| r.unwrap()).collect().await;

        assert_eq!(fragments.len(), DEFAULT_RESPONSE.chars().count());
        assert!(fragments.iter().all(|f| f.chars().count() == 1));
        assert_eq!(fragments.concat(), DEFAULT_RESPONSE);
    }

    #[tokio::test(start_paused = true)]
    async fn paces_characters() {
        let client = DemoClient::new(Duration::from_millis(20));
        let start = tokio::time::Instant::now();
        let mut stream = client.complete("hi").await.unwrap();

        stream.next().await.unwrap().unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        stream.next().await.unwrap().unwrap();
        assert!(start.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn identifies_as_demo() {
        let client = DemoClient::new(Duration::ZERO);
        assert!(client.is_demo());
        assert_eq!(client.name(), "demo");
    }
}
