// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! The model boundary: streaming text, HTML, and image generation.
//!
//! The server core only depends on the [`ModelClient`] trait; the bundled
//! [`GeminiClient`] implements it over the REST streaming API with SSE
//! framing. Each streamed chunk must carry exactly one candidate; text
//! chunks must carry exactly one part; an image stream may carry at most one
//! inline-data part.

mod client;
mod wire;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

pub use client::GeminiClient;
pub use wire::{Candidate, ChunkContent, InlineData, Part, StreamChunk};

/// Best-effort sink for streamed model output. Implementations must not
/// block.
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ModelErrorCode {
    Transport,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelError {
    pub code: ModelErrorCode,
    pub message: String,
}

impl ModelError {
    #[must_use]
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            code: ModelErrorCode::Transport,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn unexpected(message: impl Into<String>) -> Self {
        Self {
            code: ModelErrorCode::Unexpected,
            message: message.into(),
        }
    }
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            ModelErrorCode::Transport => write!(f, "model transport error: {}", self.message),
            ModelErrorCode::Unexpected => {
                write!(f, "unexpected response from model: {}", self.message)
            }
        }
    }
}

impl std::error::Error for ModelError {}

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream a plain-text completion, forwarding chunks to `progress`.
    async fn text(&self, prompt: &str, progress: &ProgressFn) -> Result<String, ModelError>;

    /// Stream an HTML completion and return the `<html>...</html>` span.
    /// Content outside the markers is stripped; a response without both
    /// markers is an error.
    async fn html(&self, prompt: &str, progress: &ProgressFn) -> Result<String, ModelError>;

    /// Stream an image generation and return the raw PNG bytes. Text parts
    /// are forwarded to `progress`.
    async fn png(&self, prompt: &str, progress: &ProgressFn) -> Result<Vec<u8>, ModelError>;
}

/// Cut the generated document down to its `<html ... </html>` span.
pub(crate) fn extract_html_envelope(raw: &str) -> Result<&str, ModelError> {
    let start = raw
        .find("<html")
        .ok_or_else(|| ModelError::unexpected("no <html> tag found in response"))?;
    let raw = &raw[start..];
    let end = raw
        .rfind("</html>")
        .ok_or_else(|| ModelError::unexpected("no </html> closing tag found in response"))?;
    Ok(&raw[..end + "</html>".len()])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_strips_surrounding_noise() {
        let raw = "```html\n<html lang=\"en\"><body>hi</body></html>\nthanks!";
        assert_eq!(
            extract_html_envelope(raw).expect("envelope"),
            "<html lang=\"en\"><body>hi</body></html>"
        );
    }

    #[test]
    fn envelope_requires_both_markers() {
        assert!(extract_html_envelope("<body>nope</body>").is_err());
        assert!(extract_html_envelope("<html><body>open").is_err());
        assert!(extract_html_envelope("</html>").is_err());
    }

    #[test]
    fn envelope_takes_last_closing_tag() {
        let raw = "<html>a</html>b</html>";
        assert_eq!(extract_html_envelope(raw).expect("envelope"), raw);
    }
}
