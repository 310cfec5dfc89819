// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Sanitization of model-produced documents.
//!
//! Every URL-bearing attribute, `srcset` descriptor list, `style` attribute,
//! and `<style>` element is rewritten through a caller-supplied URL mapper,
//! and the rewritten values are collected so the caller can register them as
//! new site resources. A second pass can strip whole elements by name.

mod css;
mod html;

use std::fmt;

pub use css::rewrite_css;
pub use html::{parse_html, remove_elements, render_html, rewrite_urls, MAX_DEPTH};

/// Re-exported so callers can hand documents back for rendering and
/// transformation without naming the DOM crate themselves.
pub use markup5ever_rcdom::{Handle, NodeData, RcDom};

#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SanitizeError {
    MaxDepthExceeded,
    Render(String),
}

impl fmt::Display for SanitizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxDepthExceeded => write!(f, "maximum depth exceeded"),
            Self::Render(message) => write!(f, "failed to render html: {message}"),
        }
    }
}

impl std::error::Error for SanitizeError {}
