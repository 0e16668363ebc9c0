//! Streaming chat backends.
//!
//! [`OpenAiBackend`] posts to `/v1/chat/completions` with `stream: true` and
//! turns the SSE response into a stream of content tokens. The stream ends
//! at the `[DONE]` marker or when the connection closes.

use super::sse::SseLineParser;
use crate::error::{DeckError, Result};
use crate::session::ChatMessage;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde::Serialize;
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::debug;

/// Content tokens in arrival order. An `Err` item ends the stream.
pub type TokenStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// One chat completion request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f64,
    pub max_tokens: usize,
    pub stream: bool,
}

impl ChatRequest {
    pub fn new(
        model: impl Into<String>,
        messages: Vec<ChatMessage>,
        temperature: f64,
        max_tokens: usize,
    ) -> Self {
        Self {
            model: model.into(),
            messages,
            temperature,
            max_tokens,
            stream: true,
        }
    }
}

/// Anything that can stream a chat completion.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Start a streaming completion against the server at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`DeckError::Connectivity`] when the request cannot be sent
    /// or the server rejects it.
    async fn stream_chat(&self, url: &str, request: &ChatRequest) -> Result<TokenStream>;
}

/// OpenAI-compatible streaming client.
#[derive(Debug, Clone)]
pub struct OpenAiBackend {
    client: reqwest::Client,
    timeout: Duration,
}

impl OpenAiBackend {
    /// Requests (including the whole streamed body) time out after `timeout`.
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            timeout,
        }
    }

    fn completions_url(url: &str) -> String {
        format!("{}/v1/chat/completions", crate::routing::probe::base_url(url))
    }
}

#[async_trait]
impl ChatBackend for OpenAiBackend {
    async fn stream_chat(&self, url: &str, request: &ChatRequest) -> Result<TokenStream> {
        let endpoint = Self::completions_url(url);
        debug!(endpoint, model = %request.model, messages = request.messages.len(), "sending chat request");

        let response = self
            .client
            .post(&endpoint)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| DeckError::Connectivity(format!("{endpoint}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(200).collect();
            return Err(DeckError::Connectivity(format!(
                "{endpoint} returned HTTP {}: {body}",
                status.as_u16()
            )));
        }

        Ok(Box::pin(token_stream(response.bytes_stream())))
    }
}

struct StreamState<S> {
    bytes: Pin<Box<S>>,
    parser: SseLineParser,
    buffered: VecDeque<String>,
    finished: bool,
}

/// Convert an SSE byte stream into content tokens.
pub fn token_stream<S>(bytes: S) -> impl Stream<Item = Result<String>> + Send
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + 'static,
{
    futures_util::stream::unfold(
        StreamState {
            bytes: Box::pin(bytes),
            parser: SseLineParser::new(),
            buffered: VecDeque::new(),
            finished: false,
        },
        |mut state| async move {
            loop {
                if let Some(token) = state.buffered.pop_front() {
                    return Some((Ok(token), state));
                }
                if state.finished {
                    return None;
                }

                match state.bytes.next().await {
                    Some(Ok(chunk)) => {
                        for event in state.parser.push(&chunk) {
                            if event.is_done() {
                                state.finished = true;
                                break;
                            }
                            if let Some(token) = parse_chunk(&event.data) {
                                state.buffered.push_back(token);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        state.finished = true;
                        return Some((Err(DeckError::Stream(e.to_string())), state));
                    }
                    None => {
                        state.finished = true;
                        if let Some(event) = state.parser.flush() {
                            if !event.is_done() {
                                if let Some(token) = parse_chunk(&event.data) {
                                    state.buffered.push_back(token);
                                }
                            }
                        }
                    }
                }
            }
        },
    )
}

/// Extract the content delta from one streamed chunk.
///
/// Malformed chunks and chunks without content (role headers, finish
/// reasons) yield `None`.
pub fn parse_chunk(data: &str) -> Option<String> {
    let json: serde_json::Value = match serde_json::from_str(data) {
        Ok(json) => json,
        Err(e) => {
            debug!(error = %e, "dropping malformed stream chunk");
            return None;
        }
    };

    let choice = json.get("choices")?.get(0)?;
    let content = choice
        .get("delta")
        .and_then(|d| d.get("content"))
        .or_else(|| choice.get("message").and_then(|m| m.get("content")))
        .or_else(|| choice.get("text"))?
        .as_str()?;

    if content.is_empty() {
        None
    } else {
        Some(content.to_owned())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use futures_util::stream;

    fn chunk(content: &str) -> String {
        format!(
            "data: {}\n\n",
            serde_json::json!({"choices":[{"delta":{"content":content}}]})
        )
    }

    async fn collect(parts: Vec<String>) -> Vec<Result<String>> {
        let bytes = stream::iter(
            parts
                .into_iter()
                .map(|p| Ok::<_, reqwest::Error>(Bytes::from(p))),
        );
        token_stream(bytes).collect().await
    }

    #[test]
    fn parse_chunk_variants() {
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            Some("Hi".into())
        );
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            None
        );
        assert_eq!(
            parse_chunk(r#"{"choices":[{"delta":{"content":""},"finish_reason":"stop"}]}"#),
            None
        );
        assert_eq!(parse_chunk(r#"{"choices":[{"text":"legacy"}]}"#), Some("legacy".into()));
        assert_eq!(parse_chunk("{not json"), None);
        assert_eq!(parse_chunk(r#"{"choices":[]}"#), None);
    }

    #[test]
    fn request_serializes_stream_flag() {
        let request = ChatRequest::new("m", vec![ChatMessage::user("hi")], 0.7, 64);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["stream"], true);
        assert_eq!(json["model"], "m");
        assert_eq!(json["messages"][0]["role"], "user");
        assert_eq!(json["max_tokens"], 64);
    }

    #[test]
    fn completions_url_normalizes_base() {
        assert_eq!(
            OpenAiBackend::completions_url("http://h:8000/v1/"),
            "http://h:8000/v1/chat/completions"
        );
    }

    #[tokio::test]
    async fn tokens_in_order_until_done() {
        let tokens = collect(vec![
            chunk("Hel"),
            chunk("lo"),
            "data: [DONE]\n\n".into(),
            chunk("ignored"),
        ])
        .await;
        let tokens: Vec<String> = tokens.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn malformed_chunks_are_dropped() {
        let tokens = collect(vec![
            chunk("a"),
            "data: {broken\n\n".into(),
            chunk("b"),
        ])
        .await;
        let tokens: Vec<String> = tokens.into_iter().map(|t| t.unwrap()).collect();
        assert_eq!(tokens, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stream_without_done_flushes_tail() {
        let tail = format!(
            "data: {}",
            serde_json::json!({"choices":[{"delta":{"content":"end"}}]})
        );
        let tokens = collect(vec![chunk("x"), tail]).await;
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[1].as_ref().unwrap(), "end");
    }
}
