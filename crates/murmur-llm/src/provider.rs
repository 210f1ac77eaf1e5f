use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use futures::{Future, Stream, TryStreamExt};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::json;
use tracing::instrument;

use murmur_core::{CompletionClient, CompletionError, FragmentStream};

use crate::config::CompletionConfig;
use crate::sse::{self, ChunkOutcome, SseLine};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const APP_TITLE: &str = "murmur";

/// Streaming client for any OpenAI-compatible `/chat/completions` endpoint.
pub struct OpenAiCompatClient {
    client: Client,
    api_key: SecretString,
    endpoint: String,
    model: String,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(api_key: &SecretString, config: &CompletionConfig) -> Self {
        Self {
            client: Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .expect("failed to build HTTP client"),
            api_key: api_key.clone(),
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
        }
    }

    fn build_request(&self, prompt: &str) -> reqwest::RequestBuilder {
        let body = json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": prompt }],
            "stream": true,
        });

        self.client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .header("accept", "text/event-stream")
            .header("X-Title", APP_TITLE)
            .json(&body)
    }
}

#[async_trait]
impl CompletionClient for OpenAiCompatClient {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, prompt), fields(model = %self.model, prompt_len = prompt.len()))]
    async fn complete(&self, prompt: &str) -> Result<FragmentStream, CompletionError> {
        let send = self.build_request(prompt).send();
        let resp = tokio::time::timeout(self.request_timeout, send)
            .await
            .map_err(|_| {
                CompletionError::Network(format!(
                    "no response within {}s",
                    self.request_timeout.as_secs()
                ))
            })?
            .map_err(classify_transport)?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            tracing::warn!(status, "completion request rejected");
            return Err(sse::classify_response(status, body));
        }

        let byte_stream = resp.bytes_stream().map_err(|e| e.to_string());
        Ok(Box::pin(SseStream::new(byte_stream, self.idle_timeout)))
    }
}

fn classify_transport(e: reqwest::Error) -> CompletionError {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        CompletionError::Network(e.to_string())
    } else if let Some(status) = e.status() {
        CompletionError::from_status(status.as_u16(), e.to_string())
    } else {
        CompletionError::Network(e.to_string())
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, String>> + Send>>;

/// Turns a chunked SSE body into text fragments.
///
/// Fails with `Network` when no bytes arrive for `idle_duration`. Ends after
/// `[DONE]`, the first error, or end of body, whichever comes first.
struct SseStream {
    inner: ByteStream,
    buffer: BytesMut,
    // Fragments in arrival order; an error, if any, is always last.
    pending: VecDeque<Result<String, CompletionError>>,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
    finished: bool,
}

impl SseStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, String>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            buffer: BytesMut::new(),
            pending: VecDeque::new(),
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
            finished: false,
        }
    }

    fn drain_lines(&mut self) {
        while !self.finished {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line = self.buffer.split_to(pos + 1);
            self.handle_line(&String::from_utf8_lossy(&line));
        }
    }

    fn handle_line(&mut self, line: &str) {
        match sse::parse_line(line) {
            None => {}
            Some(SseLine::Done) => self.finished = true,
            Some(SseLine::Data(data)) => match sse::parse_chunk(&data) {
                ChunkOutcome::Fragment(text) => self.pending.push_back(Ok(text)),
                ChunkOutcome::Empty => {}
                ChunkOutcome::Failed(err) => self.fail(err),
            },
        }
    }

    fn fail(&mut self, err: CompletionError) {
        tracing::debug!(error = %err, "completion stream failed");
        self.finished = true;
        self.buffer.clear();
        self.pending.push_back(Err(err));
    }
}

impl Stream for SseStream {
    type Item = Result<String, CompletionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Poll::Ready(Some(item));
            }
            if self.finished {
                return Poll::Ready(None);
            }

            match self.inner.as_mut().poll_next(cx) {
                Poll::Ready(Some(Ok(bytes))) => {
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    self.buffer.extend_from_slice(&bytes);
                    self.drain_lines();
                }
                Poll::Ready(Some(Err(e))) => {
                    self.fail(CompletionError::Network(format!("stream interrupted: {e}")));
                }
                Poll::Ready(None) => {
                    // Body ended; a trailing line may lack its newline.
                    if !self.buffer.is_empty() {
                        let rest = self.buffer.split();
                        self.handle_line(&String::from_utf8_lossy(&rest));
                    }
                    self.finished = true;
                }
                Poll::Pending => {
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        let secs = self.idle_duration.as_secs();
                        self.fail(CompletionError::Network(format!("idle timeout after {secs}s")));
                        continue;
                    }
                    return Poll::Pending;
                }
            }
        }
    }
}
