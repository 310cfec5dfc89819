// SPDX-License-Identifier: Apache-2.0

use std::fmt;

/// Error kinds surfaced by the generation core. Everything that is not a
/// dedicated kind propagates to the HTTP response as a 500 with a textual
/// message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum SiteErrorCode {
    /// No such slug is known to the site.
    NotFound,
    /// The site outline was judged unsafe; sticky for the whole site.
    Unsafe,
    /// A slug with no or an unknown extension reached a code path that
    /// requires one.
    InvalidSlug,
    /// The model returned zero bytes, or a file read disagreed with the
    /// recorded size.
    UnexpectedSize,
    /// Sanitizer tree deeper than the walk bound.
    MaxDepthExceeded,
    /// Worker pool admission was rejected.
    WorkerPoolOverCapacity,
    /// A generator panicked inside the worker pool.
    GeneratePanic,
    Model,
    Sanitize,
    Io,
}

impl SiteErrorCode {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not found",
            Self::Unsafe => "unsafe topic",
            Self::InvalidSlug => "invalid slug",
            Self::UnexpectedSize => "unexpected size",
            Self::MaxDepthExceeded => "maximum depth exceeded",
            Self::WorkerPoolOverCapacity => "worker pool over capacity",
            Self::GeneratePanic => "generate function panicked",
            Self::Model => "model error",
            Self::Sanitize => "sanitize error",
            Self::Io => "io error",
        }
    }
}

impl fmt::Display for SiteErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SiteError {
    pub code: SiteErrorCode,
    pub message: String,
}

impl SiteError {
    #[must_use]
    pub fn new(code: SiteErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn not_found(slug: &str) -> Self {
        Self::new(SiteErrorCode::NotFound, slug)
    }

    #[must_use]
    pub fn unsafe_site() -> Self {
        Self::new(SiteErrorCode::Unsafe, "")
    }

    #[must_use]
    pub fn invalid_slug(slug: &str) -> Self {
        Self::new(SiteErrorCode::InvalidSlug, slug)
    }

    #[must_use]
    pub fn unexpected_size(message: impl Into<String>) -> Self {
        Self::new(SiteErrorCode::UnexpectedSize, message)
    }

    #[must_use]
    pub fn over_capacity() -> Self {
        Self::new(SiteErrorCode::WorkerPoolOverCapacity, "")
    }

    #[must_use]
    pub fn generate_panic(message: impl Into<String>) -> Self {
        Self::new(SiteErrorCode::GeneratePanic, message)
    }

    #[must_use]
    pub fn model(message: impl Into<String>) -> Self {
        Self::new(SiteErrorCode::Model, message)
    }

    #[must_use]
    pub fn sanitize(message: impl Into<String>) -> Self {
        Self::new(SiteErrorCode::Sanitize, message)
    }

    #[must_use]
    pub fn io(message: impl Into<String>) -> Self {
        Self::new(SiteErrorCode::Io, message)
    }

    #[must_use]
    pub fn is(&self, code: SiteErrorCode) -> bool {
        self.code == code
    }
}

impl fmt::Display for SiteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for SiteError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_and_message() {
        let err = SiteError::not_found("goat-facts.html");
        assert_eq!(err.to_string(), "not found: goat-facts.html");
        assert!(err.is(SiteErrorCode::NotFound));
    }

    #[test]
    fn display_omits_empty_message() {
        assert_eq!(SiteError::unsafe_site().to_string(), "unsafe topic");
    }
}
