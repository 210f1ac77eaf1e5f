use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::{stream, Stream, StreamExt};
use parking_lot::Mutex;

use murmur_core::{CompletionClient, CompletionError, FragmentStream};

/// Pre-programmed outcome of one `complete` call.
pub enum ScriptedResponse {
    /// Yield each fragment, then end cleanly.
    Fragments(Vec<String>),
    /// Yield each fragment with a pause before all but the first.
    Paced(Vec<String>, Duration),
    /// Yield the fragments, then fail mid-stream.
    FailAfter(Vec<String>, CompletionError),
    /// Fail before any fragment.
    Error(CompletionError),
    /// Wait, then resolve the inner response.
    Delay(Duration, Box<ScriptedResponse>),
    /// Open a stream that never yields.
    Hang,
}

impl ScriptedResponse {
    pub fn text(fragments: &[&str]) -> Self {
        Self::Fragments(fragments.iter().map(|s| s.to_string()).collect())
    }

    pub fn delayed(delay: Duration, inner: ScriptedResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Completion client that replays scripted responses in order.
///
/// Every prompt is recorded. Calls past the end of the script fail with a
/// `Provider` error.
pub struct ScriptedClient {
    responses: Mutex<VecDeque<ScriptedResponse>>,
    prompts: Mutex<Vec<String>>,
    call_count: AtomicUsize,
    dropped: Arc<AtomicUsize>,
    demo: bool,
}

impl ScriptedClient {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            prompts: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
            dropped: Arc::new(AtomicUsize::new(0)),
            demo: false,
        }
    }

    /// Report `is_demo() == true`, for exercising mode-dependent paths.
    pub fn as_demo(mut self) -> Self {
        self.demo = true;
        self
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().clone()
    }

    /// Number of returned streams that have been dropped so far.
    pub fn streams_dropped(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model(&self) -> &str {
        "scripted-model"
    }

    fn is_demo(&self) -> bool {
        self.demo
    }

    async fn complete(&self, prompt: &str) -> Result<FragmentStream, CompletionError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.prompts.lock().push(prompt.to_string());

        let Some(mut current) = self.responses.lock().pop_front() else {
            return Err(CompletionError::Provider(format!(
                "ScriptedClient: no response configured for call {idx}"
            )));
        };

        // Unrolled so nested delays don't need recursive async.
        let inner: FragmentStream = loop {
            match current {
                ScriptedResponse::Fragments(fragments) => {
                    break Box::pin(stream::iter(fragments.into_iter().map(Ok::<_, CompletionError>)));
                }
                ScriptedResponse::Paced(fragments, pause) => {
                    let paced = stream::iter(fragments.into_iter().enumerate()).then(
                        move |(i, fragment)| async move {
                            if i > 0 {
                                tokio::time::sleep(pause).await;
                            }
                            Ok::<_, CompletionError>(fragment)
                        },
                    );
                    break Box::pin(paced);
                }
                ScriptedResponse::FailAfter(fragments, err) => {
                    let items = fragments.into_iter().map(Ok).chain(std::iter::once(Err(err)));
                    break Box::pin(stream::iter(items));
                }
                ScriptedResponse::Error(err) => return Err(err),
                ScriptedResponse::Delay(duration, next) => {
                    tokio::time::sleep(duration).await;
                    current = *next;
                }
                ScriptedResponse::Hang => {
                    break Box::pin(stream::pending::<Result<String, CompletionError>>());
                }
            }
        };

        Ok(Box::pin(Tracked {
            inner,
            dropped: self.dropped.clone(),
        }))
    }
}

/// Counts drops so tests can observe that a consumer abandoned its stream.
struct Tracked {
    inner: FragmentStream,
    dropped: Arc<AtomicUsize>,
}

impl Stream for Tracked {
    type Item = Result<String, CompletionError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.dropped.fetch_add(1, Ordering::SeqCst);
    }
}
