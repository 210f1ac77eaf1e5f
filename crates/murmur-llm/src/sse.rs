//! Server-Sent Events parsing for OpenAI-compatible chat completion streams.
//!
//! The body is a series of `data: {json}` lines terminated by `data: [DONE]`.
//! Each JSON chunk carries at most one text fragment in
//! `choices[0].delta.content`; providers may also push an `{"error": ...}`
//! object mid-stream.

use serde::Deserialize;
use serde_json::Value;

use murmur_core::CompletionError;

/// One meaningful SSE line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SseLine {
    Data(String),
    Done,
}

/// What a single data payload means for the fragment stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChunkOutcome {
    Fragment(String),
    /// Role-only deltas, keep-alives, usage trailers.
    Empty,
    Failed(CompletionError),
}

/// Extract the payload of one SSE line.
///
/// Returns `None` for comments (`: OPENROUTER PROCESSING`), blank lines,
/// `event:`/`id:` fields and empty data.
pub fn parse_line(line: &str) -> Option<SseLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with(':') {
        return None;
    }

    let data = trimmed
        .strip_prefix("data: ")
        .or_else(|| trimmed.strip_prefix("data:"))?
        .trim();

    match data {
        "" => None,
        "[DONE]" => Some(SseLine::Done),
        _ => Some(SseLine::Data(data.to_string())),
    }
}

/// Parse raw SSE text into its meaningful lines.
pub fn parse_sse_lines(raw: &str) -> Vec<SseLine> {
    raw.lines().filter_map(parse_line).collect()
}

/// Interpret one `data:` JSON payload.
pub fn parse_chunk(data: &str) -> ChunkOutcome {
    let chunk: ChatChunk = match serde_json::from_str(data) {
        Ok(chunk) => chunk,
        Err(e) => {
            tracing::warn!(error = %e, data_preview = %preview(data), "unparseable SSE chunk");
            return ChunkOutcome::Failed(CompletionError::Provider(format!(
                "malformed stream chunk: {e}"
            )));
        }
    };

    if let Some(err) = chunk.error {
        return ChunkOutcome::Failed(classify_error(&err));
    }

    chunk
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.delta)
        .and_then(|d| d.content)
        .filter(|s| !s.is_empty())
        .map_or(ChunkOutcome::Empty, ChunkOutcome::Fragment)
}

/// Classify an error object embedded in a response body or stream.
fn classify_error(err: &ErrorPayload) -> CompletionError {
    let code = match &err.code {
        Some(Value::Number(n)) => n.as_u64().map(|n| n.to_string()),
        Some(Value::String(s)) => Some(s.clone()),
        _ => None,
    };
    let kind = err.error_type.as_deref().unwrap_or_default();
    let message = err.message.clone().unwrap_or_else(|| "unknown error".into());

    match code.as_deref() {
        Some("401" | "403" | "invalid_api_key") => CompletionError::Auth(message),
        Some("402" | "429" | "insufficient_quota" | "rate_limit_exceeded") => {
            CompletionError::Quota(message)
        }
        _ if kind == "insufficient_quota" => CompletionError::Quota(message),
        _ if kind == "authentication_error" => CompletionError::Auth(message),
        _ => CompletionError::Provider(message),
    }
}

/// Classify a non-2xx response, preferring the structured error body when present.
pub fn classify_response(status: u16, body: String) -> CompletionError {
    match status {
        401 | 403 | 402 | 429 => CompletionError::from_status(status, body),
        _ => match serde_json::from_str::<ErrorEnvelope>(&body) {
            Ok(ErrorEnvelope { error: Some(err) }) => match classify_error(&err) {
                CompletionError::Provider(_) => CompletionError::from_status(status, body),
                classified => classified,
            },
            _ => CompletionError::from_status(status, body),
        },
    }
}

fn preview(data: &str) -> &str {
    match data.char_indices().nth(100) {
        Some((idx, _)) => &data[..idx],
        None => data,
    }
}

// --- Deserialization types for chat completion chunks ---

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Deserialize)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorPayload>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    message: Option<String>,
    #[serde(rename = "type")]
    error_type: Option<String>,
    code: Option<Value>,
}
