// SPDX-License-Identifier: Apache-2.0

use percent_encoding::percent_decode_str;
use url::Url;

use crate::slug::{collapse_non_alphanumeric, EXTENSION_HTML, EXTENSION_JPG, INDEX_SLUG};

/// Slug emitted for URLs that cannot be expressed inside a site: unparseable
/// input and extensions outside the HTML/image families. Harmless as an
/// attribute value, never routable.
pub const DATA_URL_SENTINEL: &str = "data:";

const DUMMY_BASE: &str = "http://slug.invalid/";

/// Normalize an arbitrary raw URL (absolute, relative, or garbage) into a
/// slug. Idempotent for every output other than the `data:` sentinel.
#[must_use]
pub fn sanitize_url(raw: &str) -> String {
    let parsed = match Url::parse(raw) {
        Ok(u) => u,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            match Url::parse(DUMMY_BASE).ok().and_then(|b| b.join(raw).ok()) {
                Some(u) => u,
                None => return DATA_URL_SENTINEL.to_string(),
            }
        }
        Err(_) => return DATA_URL_SENTINEL.to_string(),
    };

    // Opaque URLs (mailto:, data:, ...) carry no hierarchical path.
    if parsed.cannot_be_a_base() {
        return INDEX_SLUG.to_string();
    }

    // A reference with no path component is the site index, query or not
    // (an in-page "?sort=asc" link stays on index.html). Checked against
    // the raw text: the parser reports "/" for both a missing path and an
    // explicit one, and only the latter folds its query into the slug.
    if has_empty_path(raw) {
        return INDEX_SLUG.to_string();
    }

    let path = percent_decode_str(parsed.path())
        .decode_utf8_lossy()
        .to_lowercase();

    let (mut stem, ext) = match path.rfind('.') {
        Some(idx) => (path[..idx].to_string(), &path[idx..]),
        None => (path.to_string(), ""),
    };

    if let Some(query) = parsed.query() {
        stem.push('?');
        stem.push_str(&query.to_lowercase());
    }

    let safe = collapse_non_alphanumeric(&stem);
    if safe.is_empty() {
        return INDEX_SLUG.to_string();
    }

    match ext {
        ".jpg" | ".jpeg" | ".png" | ".gif" | ".webp" | ".svg" => safe + EXTENSION_JPG,
        "" | ".html" | ".htm" => safe + EXTENSION_HTML,
        _ => DATA_URL_SENTINEL.to_string(),
    }
}

/// Whether the raw reference has no path component: nothing between the
/// scheme/authority and the query or fragment.
fn has_empty_path(raw: &str) -> bool {
    let end = raw.find(['?', '#']).unwrap_or(raw.len());
    let mut rest = &raw[..end];

    if let Some(colon) = rest.find(':') {
        let scheme = &rest[..colon];
        if scheme.starts_with(|c: char| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
        {
            rest = &rest[colon + 1..];
        }
    }

    if let Some(after_authority) = rest.strip_prefix("//") {
        return !after_authority.contains('/');
    }

    rest.is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_become_slugs() {
        assert_eq!(sanitize_url("link1.png"), "link1.jpg");
        assert_eq!(sanitize_url("goat-facts-continued.html"), "goat-facts-continued.html");
        assert_eq!(sanitize_url("about"), "about.html");
        assert_eq!(sanitize_url("/nested/path/page.htm"), "nested-path-page.html");
    }

    #[test]
    fn image_extensions_collapse_to_jpg() {
        for ext in ["jpg", "jpeg", "png", "gif", "webp", "svg"] {
            assert_eq!(sanitize_url(&format!("photo.{ext}")), "photo.jpg");
        }
    }

    #[test]
    fn unknown_extensions_are_dropped() {
        assert_eq!(sanitize_url("script.js"), DATA_URL_SENTINEL);
        assert_eq!(sanitize_url("doc.pdf"), DATA_URL_SENTINEL);
    }

    #[test]
    fn empty_and_opaque_map_to_index() {
        assert_eq!(sanitize_url(""), INDEX_SLUG);
        assert_eq!(sanitize_url("mailto:goat@example.com"), INDEX_SLUG);
        assert_eq!(sanitize_url("data:image/png;base64,AAAA"), INDEX_SLUG);
        assert_eq!(sanitize_url("http://example.com"), INDEX_SLUG);
        assert_eq!(sanitize_url("/"), INDEX_SLUG);
    }

    #[test]
    fn query_strings_fold_into_the_stem() {
        assert_eq!(sanitize_url("page.html?Sort=ASC&x=1"), "page-sort-asc-x-1.html");
        assert_eq!(sanitize_url("search?q=goats"), "search-q-goats.html");
    }

    #[test]
    fn pathless_references_are_the_index_regardless_of_query() {
        // In-page links like href="?sort=asc" stay on the index.
        assert_eq!(sanitize_url("?sort=asc"), INDEX_SLUG);
        assert_eq!(sanitize_url("#section"), INDEX_SLUG);
        assert_eq!(sanitize_url("http://example.com?q=1"), INDEX_SLUG);
        // An explicit root path keeps its query.
        assert_eq!(sanitize_url("http://example.com/?q=1"), "q-1.html");
    }

    #[test]
    fn absolute_urls_keep_only_the_path() {
        assert_eq!(
            sanitize_url("https://example.com/a/b/photo.png?v=2"),
            "a-b-photo-v-2.jpg"
        );
    }

    #[test]
    fn percent_encoding_is_decoded_before_collapsing() {
        assert_eq!(sanitize_url("a%20b.html"), "a-b.html");
    }

    #[test]
    fn uppercase_is_folded() {
        assert_eq!(sanitize_url("Goat-Facts.HTML"), "goat-facts.html");
    }

    #[test]
    fn idempotent_on_all_non_sentinel_outputs() {
        let inputs = [
            "link1.png",
            "a b c.html",
            "page.html?Sort=ASC",
            "https://example.com/x/y.webp",
            "",
            "mailto:x@y",
            "UPPER.HTM",
            "weird//path///deep.gif",
        ];
        for input in inputs {
            let once = sanitize_url(input);
            if once == DATA_URL_SENTINEL {
                continue;
            }
            assert_eq!(sanitize_url(&once), once, "not idempotent for {input:?}");
        }
    }
}
