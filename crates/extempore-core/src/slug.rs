// SPDX-License-Identifier: Apache-2.0

use crate::error::SiteError;

pub const INDEX_SLUG: &str = "index.html";
pub const NOT_FOUND_SLUG: &str = "not-found.html";

pub const EXTENSION_HTML: &str = ".html";
pub const EXTENSION_JPG: &str = ".jpg";

pub const CONTENT_TYPE_HTML: &str = "text/html; charset=utf-8";
pub const CONTENT_TYPE_JPG: &str = "image/jpeg";

/// Longest site prefix the front door accepts.
pub const MAX_PREFIX_LEN: usize = 40;

/// The extension of a slug, dot included. A slug without a dot is a
/// programming-error state surfaced as `InvalidSlug`.
pub fn extension_for_slug(slug: &str) -> Result<&str, SiteError> {
    match slug.rfind('.') {
        Some(idx) => Ok(&slug[idx..]),
        None => Err(SiteError::invalid_slug(slug)),
    }
}

pub fn content_type_for_slug(slug: &str) -> Result<&'static str, SiteError> {
    match extension_for_slug(slug)? {
        EXTENSION_HTML => Ok(CONTENT_TYPE_HTML),
        EXTENSION_JPG => Ok(CONTENT_TYPE_JPG),
        _ => Err(SiteError::invalid_slug(slug)),
    }
}

/// Collapse a raw path segment into prefix form: lowercase, every run of
/// characters outside `[a-z0-9]` becomes a single `-`, leading and trailing
/// dashes trimmed.
#[must_use]
pub fn normalize_prefix(raw: &str) -> String {
    collapse_non_alphanumeric(&raw.to_lowercase())
}

/// Shared by prefix validation and `sanitize_url`. Trimming falls out of the
/// run handling: a leading run emits nothing and a trailing run is never
/// flushed.
#[must_use]
pub(crate) fn collapse_non_alphanumeric(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut pending_dash = false;
    for c in s.chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c);
        } else {
            pending_dash = true;
        }
    }
    out
}
