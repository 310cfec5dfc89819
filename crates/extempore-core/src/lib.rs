// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]

//! Shared vocabulary of the extempore server: the slug grammar, the
//! URL-to-slug normalization, and the error kinds every other crate speaks.

mod error;
mod slug;
mod url_norm;

pub use error::{SiteError, SiteErrorCode};
pub use slug::{
    content_type_for_slug, extension_for_slug, normalize_prefix, CONTENT_TYPE_HTML,
    CONTENT_TYPE_JPG, EXTENSION_HTML, EXTENSION_JPG, INDEX_SLUG, MAX_PREFIX_LEN, NOT_FOUND_SLUG,
};
pub use url_norm::{sanitize_url, DATA_URL_SENTINEL};
