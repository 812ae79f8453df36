//! Text generation capability.
//!
//! [`TextGenerator`] is the seam between the chat engine and the language
//! model. [`GeminiGenerator`] calls `generateContent` for one-shot answers
//! and `streamGenerateContent?alt=sse` for incremental delivery; the SSE
//! body is split into events by [`SseDecoder`].

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, Stream, StreamExt};

use crate::config::GenerationConfig;
use crate::embedding::GEMINI_BASE_URL;
use crate::http::send_with_retry;

/// Incremental text deltas. An `Err` item ends the stream.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Sampling parameters for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub top_p: f32,
    pub top_k: u32,
}

impl GenerationParams {
    pub fn from_config(config: &GenerationConfig) -> Self {
        Self {
            temperature: config.temperature,
            max_output_tokens: config.max_output_tokens,
            top_p: config.top_p,
            top_k: config.top_k,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self::from_config(&GenerationConfig::default())
    }
}

#[async_trait]
pub trait TextGenerator: Send + Sync {
    fn model_name(&self) -> &str;

    /// Generate a complete answer.
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;

    /// Generate incrementally. Dropping the returned stream abandons the
    /// request.
    ///
    /// The default implementation yields the whole [`generate`](Self::generate)
    /// result as a single delta.
    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream> {
        let text = self.generate(prompt, params).await?;
        Ok(Box::pin(stream::once(async move { Ok(text) })))
    }
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl TextGenerator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str, _params: &GenerationParams) -> Result<String> {
        bail!("Generation provider is disabled")
    }
}

// ============ SSE decoding ============

/// Splits a `text/event-stream` byte stream into event data payloads.
///
/// Bytes are buffered until a full line is available, so multi-byte
/// characters split across network chunks decode correctly. Multiple
/// `data:` lines in one event are joined with `\n`. Comments and other
/// fields are ignored.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns every event completed by them.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            self.accept_line(line.trim_end_matches(['\r', '\n']), &mut events);
        }
        events
    }

    /// Flush a trailing event not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let mut events = Vec::new();
        if !self.buf.is_empty() {
            let raw = std::mem::take(&mut self.buf);
            let line = String::from_utf8_lossy(&raw).into_owned();
            self.accept_line(line.trim_end_matches('\r'), &mut events);
        }
        self.accept_line("", &mut events);
        events.pop()
    }

    fn accept_line(&mut self, line: &str, events: &mut Vec<String>) {
        if line.is_empty() {
            if !self.data.is_empty() {
                events.push(self.data.join("\n"));
                self.data.clear();
            }
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data
                .push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
}

// ============ Gemini ============

/// Gemini text generation. Requires `GOOGLE_API_KEY`.
pub struct GeminiGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_retries: u32,
}

impl GeminiGenerator {
    pub fn new(config: &GenerationConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| GEMINI_BASE_URL.to_string()),
            model: config.model.clone(),
            max_retries: config.max_retries,
        })
    }

    pub fn from_env(config: &GenerationConfig) -> Result<Self> {
        let api_key = std::env::var("GOOGLE_API_KEY")
            .context("GOOGLE_API_KEY environment variable not set")?;
        Self::new(config, api_key)
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/models/{}:{}", self.base_url, self.model, method)
    }
}

pub fn gemini_request_body(prompt: &str, params: &GenerationParams) -> serde_json::Value {
    serde_json::json!({
        "contents": [{ "role": "user", "parts": [{ "text": prompt }] }],
        "generationConfig": {
            "temperature": params.temperature,
            "maxOutputTokens": params.max_output_tokens,
            "topP": params.top_p,
            "topK": params.top_k,
        },
    })
}

/// Concatenate `candidates[0].content.parts[].text`.
///
/// Returns `Ok(None)` for frames that carry no text (e.g. a final frame
/// with only `finishReason`), and an error when the prompt was blocked.
pub fn parse_gemini_text(json: &serde_json::Value) -> Result<Option<String>> {
    if let Some(reason) = json
        .get("promptFeedback")
        .and_then(|f| f.get("blockReason"))
        .and_then(|r| r.as_str())
    {
        bail!("Gemini blocked the prompt: {}", reason);
    }
    if let Some(err) = json.get("error") {
        bail!("Gemini error: {}", err);
    }

    let parts = json
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array());

    let Some(parts) = parts else {
        return Ok(None);
    };
    let text: String = parts
        .iter()
        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
        .collect();
    Ok(if text.is_empty() { None } else { Some(text) })
}

struct StreamState {
    body: Pin<Box<dyn Stream<Item = reqwest::Result<axum::body::Bytes>> + Send>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    done: bool,
}

fn decode_event(data: &str) -> Result<Option<String>> {
    if data.trim() == "[DONE]" {
        return Ok(None);
    }
    let json: serde_json::Value =
        serde_json::from_str(data).context("Invalid Gemini stream frame")?;
    parse_gemini_text(&json)
}

/// Turn an SSE response body into text deltas.
pub fn sse_text_stream<S>(body: S) -> TextStream
where
    S: Stream<Item = reqwest::Result<axum::body::Bytes>> + Send + 'static,
{
    let state = StreamState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    let deltas = stream::unfold(state, |mut st| async move {
        loop {
            if let Some(event) = st.pending.pop_front() {
                match decode_event(&event) {
                    Ok(Some(text)) => return Some((Ok(text), st)),
                    Ok(None) => continue,
                    Err(e) => {
                        st.done = true;
                        st.pending.clear();
                        return Some((Err(e), st));
                    }
                }
            }
            if st.done {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => st.pending.extend(st.decoder.feed(&bytes)),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(anyhow::anyhow!("Gemini stream interrupted: {}", e)), st));
                }
                None => {
                    st.done = true;
                    st.pending.extend(st.decoder.finish());
                }
            }
        }
    });
    Box::pin(deltas)
}

#[async_trait]
impl TextGenerator for GeminiGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let body = gemini_request_body(prompt, params);
        let url = self.endpoint("generateContent");
        let response = send_with_retry("Gemini", self.max_retries, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;
        let json: serde_json::Value = response.json().await?;
        Ok(parse_gemini_text(&json)?
            .map(|t| t.trim().to_string())
            .unwrap_or_default())
    }

    async fn stream(&self, prompt: &str, params: &GenerationParams) -> Result<TextStream> {
        let body = gemini_request_body(prompt, params);
        let url = format!("{}?alt=sse", self.endpoint("streamGenerateContent"));
        // Retries only cover establishing the stream; a failure mid-body
        // surfaces as an error item.
        let response = send_with_retry("Gemini", self.max_retries, || {
            self.client
                .post(&url)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
        })
        .await?;
        Ok(sse_text_stream(response.bytes_stream()))
    }
}

pub fn create_generator(config: &GenerationConfig) -> Result<Arc<dyn TextGenerator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "gemini" => Ok(Arc::new(GeminiGenerator::from_env(config)?)),
        other => bail!("Unknown generation provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoder_handles_split_lines() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: {\"a\"").is_empty());
        assert!(d.feed(b": 1}\r\n").is_empty());
        assert_eq!(d.feed(b"\r\n"), vec!["{\"a\": 1}".to_string()]);
    }

    #[test]
    fn decoder_joins_multiline_data_and_skips_comments() {
        let mut d = SseDecoder::new();
        let events = d.feed(b": keepalive\nevent: message\ndata: one\ndata: two\n\ndata: three\n\n");
        assert_eq!(events, vec!["one\ntwo".to_string(), "three".to_string()]);
    }

    #[test]
    fn decoder_keeps_multibyte_chars_across_chunks() {
        let text = "data: नमस्ते\n\n".as_bytes();
        let mut d = SseDecoder::new();
        let mut events = d.feed(&text[..8]);
        events.extend(d.feed(&text[8..]));
        assert_eq!(events, vec!["नमस्ते".to_string()]);
    }

    #[test]
    fn decoder_flushes_trailing_event() {
        let mut d = SseDecoder::new();
        assert!(d.feed(b"data: tail").is_empty());
        assert_eq!(d.finish(), Some("tail".to_string()));
        assert_eq!(d.finish(), None);
    }

    #[test]
    fn parses_candidate_parts() {
        let json = serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": "Hello"}, {"text": ", world"}]}}]
        });
        assert_eq!(parse_gemini_text(&json).unwrap().as_deref(), Some("Hello, world"));

        let finish_only = serde_json::json!({"candidates": [{"finishReason": "STOP"}]});
        assert_eq!(parse_gemini_text(&finish_only).unwrap(), None);

        let blocked = serde_json::json!({"promptFeedback": {"blockReason": "SAFETY"}});
        assert!(parse_gemini_text(&blocked).is_err());
    }

    #[test]
    fn request_body_carries_params() {
        let params = GenerationParams::default().with_temperature(0.2);
        let body = gemini_request_body("hi", &params);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 2048);
        assert_eq!(body["generationConfig"]["topK"], 40);
        let t = body["generationConfig"]["temperature"].as_f64().unwrap();
        assert!((t - 0.2).abs() < 1e-6);
    }

    #[tokio::test]
    async fn sse_stream_yields_deltas_in_order() {
        let frames: Vec<reqwest::Result<axum::body::Bytes>> = vec![
            Ok(axum::body::Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Hel\"}]}}]}\n\n",
            )),
            Ok(axum::body::Bytes::from_static(
                b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"lo\"}]}}]}\n\ndata: {\"candidates\":[{\"finishReason\":\"STOP\"}]}\n\n",
            )),
        ];
        let deltas: Vec<String> = sse_text_stream(stream::iter(frames))
            .map(|r| r.unwrap())
            .collect()
            .await;
        assert_eq!(deltas, vec!["Hel".to_string(), "lo".to_string()]);
    }

    #[tokio::test]
    async fn sse_stream_stops_on_bad_frame() {
        let frames: Vec<reqwest::Result<axum::body::Bytes>> = vec![Ok(axum::body::Bytes::from_static(b"data: not json\n\ndata: {}\n\n"))];
        let items: Vec<Result<String>> = sse_text_stream(stream::iter(frames)).collect().await;
        assert_eq!(items.len(), 1);
        assert!(items[0].is_err());
    }

    #[tokio::test]
    async fn default_stream_wraps_generate() {
        struct Echo;
        #[async_trait]
        impl TextGenerator for Echo {
            fn model_name(&self) -> &str {
                "echo"
            }
            async fn generate(&self, prompt: &str, _p: &GenerationParams) -> Result<String> {
                Ok(prompt.to_uppercase())
            }
        }
        let mut s = Echo.stream("abc", &GenerationParams::default()).await.unwrap();
        assert_eq!(s.next().await.unwrap().unwrap(), "ABC");
        assert!(s.next().await.is_none());
        assert!(DisabledGenerator
            .generate("x", &GenerationParams::default())
            .await
            .is_err());
    }
}
