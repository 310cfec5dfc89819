// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;

use crate::wire::{single_candidate_parts, GenerateRequest, StreamChunk};
use crate::{extract_html_envelope, ModelClient, ModelError, ProgressFn};

const DEFAULT_HTML_MODEL: &str = "gemini-2.5-flash-lite-preview-06-17";
const DEFAULT_IMAGE_MODEL: &str = "gemini-2.0-flash-preview-image-generation";

const HTML_SYSTEM_INSTRUCTION: &str = "Return only HTML";

const API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

/// Streaming client for the Gemini REST API (`streamGenerateContent` with
/// SSE framing).
pub struct GeminiClient {
    http: reqwest::Client,
    api_key: String,
    html_model: String,
    image_model: String,
}

impl GeminiClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ModelError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| ModelError::transport(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            html_model: DEFAULT_HTML_MODEL.to_string(),
            image_model: DEFAULT_IMAGE_MODEL.to_string(),
        })
    }

    #[must_use]
    pub fn with_models(mut self, html_model: &str, image_model: &str) -> Self {
        self.html_model = html_model.to_string();
        self.image_model = image_model.to_string();
        self
    }

    /// POST the request and feed every SSE `data:` payload to `on_chunk` as
    /// it arrives.
    async fn stream(
        &self,
        model: &str,
        request: &GenerateRequest,
        on_chunk: &mut (dyn FnMut(StreamChunk) -> Result<(), ModelError> + Send),
    ) -> Result<(), ModelError> {
        let url = format!("{API_BASE}/{model}:streamGenerateContent?alt=sse");
        let mut response = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|err| ModelError::transport(format!("request failed: {err}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ModelError::transport(format!(
                "model returned {status}: {body}"
            )));
        }

        let mut buffer = Vec::new();
        while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|err| ModelError::transport(format!("stream read failed: {err}")))?
        {
            buffer.extend_from_slice(&bytes);
            drain_sse_lines(&mut buffer, on_chunk)?;
        }
        // Anything left without a trailing newline is still a frame.
        if !buffer.is_empty() {
            let line = String::from_utf8_lossy(&buffer).to_string();
            deliver_sse_line(&line, on_chunk)?;
        }
        Ok(())
    }
}

fn drain_sse_lines(
    buffer: &mut Vec<u8>,
    on_chunk: &mut (dyn FnMut(StreamChunk) -> Result<(), ModelError> + Send),
) -> Result<(), ModelError> {
    while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
        let line: Vec<u8> = buffer.drain(..=newline).collect();
        let line = String::from_utf8_lossy(&line).to_string();
        deliver_sse_line(&line, on_chunk)?;
    }
    Ok(())
}

fn deliver_sse_line(
    line: &str,
    on_chunk: &mut (dyn FnMut(StreamChunk) -> Result<(), ModelError> + Send),
) -> Result<(), ModelError> {
    let Some(payload) = parse_sse_data(line) else {
        return Ok(());
    };
    let chunk: StreamChunk = serde_json::from_str(payload)
        .map_err(|err| ModelError::unexpected(format!("bad stream payload: {err}")))?;
    on_chunk(chunk)
}

/// The payload of an SSE `data:` line, or `None` for comments, blank
/// keep-alives, and other fields.
fn parse_sse_data(line: &str) -> Option<&str> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix("data:")?;
    let payload = payload.strip_prefix(' ').unwrap_or(payload);
    if payload.is_empty() {
        return None;
    }
    Some(payload)
}

/// Fold one text chunk into `buf`. Empty chunks are skipped; more than one
/// part in a chunk is a protocol violation.
fn fold_text_chunk(
    chunk: &StreamChunk,
    progress: &ProgressFn,
    buf: &mut String,
) -> Result<(), ModelError> {
    let parts = single_candidate_parts(chunk)?;
    if parts.is_empty() {
        return Ok(());
    }
    if parts.len() != 1 {
        return Err(ModelError::unexpected(format!(
            "expected one part, got {}",
            parts.len()
        )));
    }
    let text = parts[0].text.as_deref().unwrap_or_default();
    progress(text);
    buf.push_str(text);
    Ok(())
}

/// Fold one image chunk: text parts go to progress, inline data is decoded.
/// A second inline-data part anywhere in the stream is a protocol violation.
fn fold_image_chunk(
    chunk: &StreamChunk,
    progress: &ProgressFn,
    image: &mut Option<Vec<u8>>,
) -> Result<(), ModelError> {
    for part in single_candidate_parts(chunk)? {
        if let Some(text) = part.text.as_deref() {
            if !text.is_empty() {
                progress(text);
            }
        }
        if let Some(inline) = &part.inline_data {
            if image.is_some() {
                return Err(ModelError::unexpected("multiple image parts received"));
            }
            let bytes = BASE64_STANDARD
                .decode(&inline.data)
                .map_err(|err| ModelError::unexpected(format!("bad inline data: {err}")))?;
            *image = Some(bytes);
        }
    }
    Ok(())
}

#[async_trait]
impl ModelClient for GeminiClient {
    async fn text(&self, prompt: &str, progress: &ProgressFn) -> Result<String, ModelError> {
        let request = GenerateRequest::from_prompt(prompt);
        let mut buf = String::new();
        self.stream(&self.html_model, &request, &mut |chunk| {
            fold_text_chunk(&chunk, progress, &mut buf)
        })
        .await?;
        Ok(buf)
    }

    async fn html(&self, prompt: &str, progress: &ProgressFn) -> Result<String, ModelError> {
        let request =
            GenerateRequest::from_prompt(prompt).with_system_instruction(HTML_SYSTEM_INSTRUCTION);
        let mut buf = String::new();
        self.stream(&self.html_model, &request, &mut |chunk| {
            fold_text_chunk(&chunk, progress, &mut buf)
        })
        .await?;
        Ok(extract_html_envelope(&buf)?.to_string())
    }

    async fn png(&self, prompt: &str, progress: &ProgressFn) -> Result<Vec<u8>, ModelError> {
        let request =
            GenerateRequest::from_prompt(prompt).with_response_modalities(&["TEXT", "IMAGE"]);
        let mut image = None;
        self.stream(&self.image_model, &request, &mut |chunk| {
            fold_image_chunk(&chunk, progress, &mut image)
        })
        .await?;
        image.ok_or_else(|| ModelError::unexpected("no image received"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn silent_progress() -> ProgressFn {
        Arc::new(|_| {})
    }

    fn collecting_progress() -> (ProgressFn, Arc<std::sync::Mutex<String>>) {
        let seen = Arc::new(std::sync::Mutex::new(String::new()));
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |text| {
            if let Ok(mut guard) = sink.lock() {
                guard.push_str(text);
            }
        });
        (progress, seen)
    }

    fn text_chunk(text: &str) -> StreamChunk {
        serde_json::from_str(&format!(
            r#"{{"candidates":[{{"content":{{"parts":[{{"text":{}}}]}}}}]}}"#,
            serde_json::to_string(text).expect("encode")
        ))
        .expect("chunk")
    }

    #[test]
    fn sse_data_lines_are_extracted() {
        assert_eq!(parse_sse_data("data: {\"x\":1}\n"), Some("{\"x\":1}"));
        assert_eq!(parse_sse_data("data:{\"x\":1}\r\n"), Some("{\"x\":1}"));
        assert_eq!(parse_sse_data(": keep-alive\n"), None);
        assert_eq!(parse_sse_data("event: done\n"), None);
        assert_eq!(parse_sse_data("\n"), None);
    }

    #[test]
    fn drain_handles_split_frames() {
        let mut collected = Vec::new();
        let mut buffer = Vec::new();
        buffer.extend_from_slice(b"data: {\"candidates\":[{\"content\":{\"parts\"");
        drain_sse_lines(&mut buffer, &mut |chunk: StreamChunk| {
            collected.push(chunk);
            Ok(())
        })
        .expect("drain");
        assert!(collected.is_empty());
        buffer.extend_from_slice(b":[{\"text\":\"hi\"}]}}]}\n\ndata: {\"candidates\":[{}]}\n");
        drain_sse_lines(&mut buffer, &mut |chunk: StreamChunk| {
            collected.push(chunk);
            Ok(())
        })
        .expect("drain");
        assert_eq!(collected.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn text_chunks_concatenate_and_mirror_to_progress() {
        let (progress, seen) = collecting_progress();
        let mut buf = String::new();
        fold_text_chunk(&text_chunk("hel"), &progress, &mut buf).expect("fold");
        fold_text_chunk(&text_chunk("lo"), &progress, &mut buf).expect("fold");
        assert_eq!(buf, "hello");
        assert_eq!(*seen.lock().expect("lock"), "hello");
    }

    #[test]
    fn text_chunk_with_two_parts_is_rejected() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#,
        )
        .expect("chunk");
        let mut buf = String::new();
        assert!(fold_text_chunk(&chunk, &silent_progress(), &mut buf).is_err());
    }

    #[test]
    fn image_stream_rejects_second_inline_part() {
        let chunk: StreamChunk = serde_json::from_str(
            r#"{"candidates":[{"content":{"parts":[{"inlineData":{"mimeType":"image/png","data":"AAAA"}}]}}]}"#,
        )
        .expect("chunk");
        let mut image = None;
        fold_image_chunk(&chunk, &silent_progress(), &mut image).expect("first");
        assert!(image.is_some());
        assert!(fold_image_chunk(&chunk, &silent_progress(), &mut image).is_err());
    }

    #[test]
    fn image_text_parts_reach_progress() {
        let (progress, seen) = collecting_progress();
        let chunk = text_chunk("painting...");
        let mut image = None;
        fold_image_chunk(&chunk, &progress, &mut image).expect("fold");
        assert!(image.is_none());
        assert_eq!(*seen.lock().expect("lock"), "painting...");
    }
}
