// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeSet;

use cssparser::{Parser, ParserInput, Token};

/// Rewrite every `url(...)` token in a stylesheet or style attribute through
/// `map_url`, collecting the mapped URLs. Everything that is not a URL token
/// is passed through verbatim, byte for byte.
#[must_use]
pub fn rewrite_css(raw: &str, urls: &mut BTreeSet<String>, map_url: &dyn Fn(&str) -> String) -> String {
    let mut input = ParserInput::new(raw);
    let mut parser = Parser::new(&mut input);
    let mut spans: Vec<(usize, usize, String)> = Vec::new();
    collect_url_spans(&mut parser, raw, urls, map_url, &mut spans);

    let mut out = String::with_capacity(raw.len());
    let mut last = 0;
    for (start, end, replacement) in spans {
        out.push_str(&raw[last..start]);
        out.push_str(&replacement);
        last = end;
    }
    out.push_str(&raw[last..]);
    out
}

fn collect_url_spans<'i>(
    parser: &mut Parser<'i, '_>,
    raw: &str,
    urls: &mut BTreeSet<String>,
    map_url: &dyn Fn(&str) -> String,
    spans: &mut Vec<(usize, usize, String)>,
) {
    loop {
        let start = parser.position();
        let token = match parser.next_including_whitespace_and_comments() {
            Ok(token) => token.clone(),
            Err(_) => return,
        };
        match token {
            Token::UnquotedUrl(_) | Token::BadUrl(_) => {
                let end = parser.position();
                let span = &raw[start.byte_index()..end.byte_index()];
                spans.push((
                    start.byte_index(),
                    end.byte_index(),
                    rewrite_url_token(span, urls, map_url),
                ));
            }
            // The tokenizer only emits a url-token for the unquoted form;
            // `url("...")` arrives as a function token.
            Token::Function(ref name) if name.eq_ignore_ascii_case("url") => {
                let _ = parser.parse_nested_block(|block| -> Result<(), cssparser::ParseError<'i, ()>> {
                    while block.next_including_whitespace_and_comments().is_ok() {}
                    Ok(())
                });
                let end = parser.position();
                let span = &raw[start.byte_index()..end.byte_index()];
                spans.push((
                    start.byte_index(),
                    end.byte_index(),
                    rewrite_url_token(span, urls, map_url),
                ));
            }
            Token::Function(_)
            | Token::ParenthesisBlock
            | Token::SquareBracketBlock
            | Token::CurlyBracketBlock => {
                // url() may hide inside other functions (image-set, ...) and
                // inside rule blocks.
                let _ = parser.parse_nested_block(|block| -> Result<(), cssparser::ParseError<'i, ()>> {
                    collect_url_spans(block, raw, urls, map_url, spans);
                    Ok(())
                });
            }
            _ => {}
        }
    }
}

fn rewrite_url_token(
    raw: &str,
    urls: &mut BTreeSet<String>,
    map_url: &dyn Fn(&str) -> String,
) -> String {
    if raw.len() < "url()".len()
        || !raw[.."url(".len()].eq_ignore_ascii_case("url(")
        || !raw.ends_with(')')
    {
        return raw.to_string();
    }

    let inner = raw["url(".len()..raw.len() - 1].trim();
    if inner.is_empty() {
        return "url()".to_string();
    }

    let (quote, content, escape): (&str, String, fn(&str) -> String) = match inner.as_bytes()[0] {
        b'\'' => {
            let rest = &inner[1..];
            let content = match rest.rfind('\'') {
                Some(end) => &rest[..end],
                None => rest,
            };
            ("'", content.replace("\\'", "'"), escape_single_quoted)
        }
        b'"' => {
            let rest = &inner[1..];
            let content = match rest.rfind('"') {
                Some(end) => &rest[..end],
                None => rest,
            };
            ("\"", content.replace("\\\"", "\""), escape_double_quoted)
        }
        _ => ("", inner.to_string(), escape_unquoted),
    };

    let decoded = unescape_characters(&unescape_hex(&content));
    let mapped = map_url(&decoded);
    urls.insert(mapped.clone());

    format!("url({quote}{}{quote})", escape(&mapped))
}

/// First unescape pass: `\<hex>{1,6}` optionally followed by a single space
/// becomes the encoded code point. Invalid code points keep the escape text.
fn unescape_hex(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(pos) = rest.find('\\') {
        let (head, tail) = rest.split_at(pos);
        out.push_str(head);
        let after = &tail[1..];
        let hex_len = after
            .bytes()
            .take(6)
            .take_while(u8::is_ascii_hexdigit)
            .count();
        if hex_len == 0 {
            out.push('\\');
            rest = after;
            continue;
        }
        let mut consumed = 1 + hex_len;
        if tail.as_bytes().get(consumed) == Some(&b' ') {
            consumed += 1;
        }
        match u32::from_str_radix(&after[..hex_len], 16)
            .ok()
            .and_then(char::from_u32)
        {
            Some(c) => out.push(c),
            None => out.push_str(&tail[..consumed]),
        }
        rest = &tail[consumed..];
    }
    out.push_str(rest);
    out
}

/// Second unescape pass: C-style character escapes plus `\<newline>` line
/// continuations. A trailing lone backslash survives.
fn unescape_characters(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut escaped = false;
    for c in input.chars() {
        if !escaped {
            if c == '\\' {
                escaped = true;
                continue;
            }
            out.push(c);
            continue;
        }
        match c {
            // \ CR LF collapses through the continuation arm below.
            '\r' => continue,
            '\n' | '\x0c' => {
                escaped = false;
                continue;
            }
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            'f' => out.push('\x0c'),
            '\\' => out.push('\\'),
            other => out.push(other),
        }
        escaped = false;
    }
    if escaped {
        out.push('\\');
    }
    out
}

fn escape_single_quoted(v: &str) -> String {
    escape_quoted(v, '\'')
}

fn escape_double_quoted(v: &str) -> String {
    escape_quoted(v, '"')
}

fn escape_quoted(v: &str, quote: char) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\x0c' => out.push_str("\\f"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c if c == quote => {
                out.push('\\');
                out.push(c);
            }
            c => out.push(c),
        }
    }
    out
}

fn escape_unquoted(v: &str) -> String {
    let mut out = String::with_capacity(v.len());
    for c in v.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\'' => out.push_str("\\'"),
            '(' => out.push_str("\\("),
            ')' => out.push_str("\\)"),
            ' ' => out.push_str("\\ "),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\x0c' => out.push_str("\\f"),
            '\t' => out.push_str("\\t"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wrap(u: &str) -> String {
        format!("X({u})")
    }

    fn run(input: &str) -> (String, BTreeSet<String>) {
        let mut urls = BTreeSet::new();
        let out = rewrite_css(input, &mut urls, &wrap);
        (out, urls)
    }

    #[test]
    fn unquoted_url_with_hex_escape() {
        let (out, urls) = run("body{background:url(bg\\20 1.png)}");
        assert_eq!(out, "body{background:url(X\\(bg\\ 1.png\\))}");
        assert!(urls.contains("X(bg 1.png)"));
    }

    #[test]
    fn single_quoted_url() {
        let (out, urls) = run("background: url('bg\\20 2.png'); color: red;");
        assert_eq!(out, "background: url('X(bg 2.png)'); color: red;");
        assert!(urls.contains("X(bg 2.png)"));
    }

    #[test]
    fn double_quoted_url() {
        let (out, urls) = run(r#"background: url("bg\20 3.png"); color: red;"#);
        assert_eq!(out, r#"background: url("X(bg 3.png)"); color: red;"#);
        assert!(urls.contains("X(bg 3.png)"));
    }

    #[test]
    fn non_url_tokens_pass_through_verbatim() {
        let input = "body { color: #ff0000; margin: 0 auto; /* url(in-comment.png) */ }";
        let (out, urls) = run(input);
        assert_eq!(out, input);
        assert!(urls.is_empty());
    }

    #[test]
    fn url_inside_nested_function() {
        let (out, urls) = run("background-image: image-set(url(a.png) 1x, url('b.png') 2x);");
        assert_eq!(
            out,
            "background-image: image-set(url(X\\(a.png\\)) 1x, url('X(b.png)') 2x);"
        );
        assert!(urls.contains("X(a.png)"));
        assert!(urls.contains("X(b.png)"));
    }

    #[test]
    fn url_inside_rule_block() {
        let (out, urls) = run("@media screen { body { background: url(deep.png); } }");
        assert_eq!(out, "@media screen { body { background: url(X\\(deep.png\\)); } }");
        assert!(urls.contains("X(deep.png)"));
    }

    #[test]
    fn empty_url_is_left_alone() {
        let (out, urls) = run("background: url();");
        assert_eq!(out, "background: url();");
        assert!(urls.is_empty());
    }

    #[test]
    fn quote_characters_in_mapped_urls_are_escaped() {
        let mut urls = BTreeSet::new();
        let out = rewrite_css("background: url('x')", &mut urls, &|_| "a'b".to_string());
        assert_eq!(out, "background: url('a\\'b')");
    }

    #[test]
    fn character_escapes_decode_before_mapping() {
        let (_, urls) = run("background: url(a\\nb.png)");
        assert!(urls.contains("X(a\nb.png)"), "urls: {urls:?}");
    }

    #[test]
    fn hex_unescape_rules() {
        assert_eq!(unescape_hex("bg\\20 1.png"), "bg 1.png");
        assert_eq!(unescape_hex("\\41\\42"), "AB");
        assert_eq!(unescape_hex("no-escape"), "no-escape");
        // Surrogate code points keep the original escape text.
        assert_eq!(unescape_hex("\\d800 x"), "\\d800 x");
    }

    #[test]
    fn character_unescape_rules() {
        assert_eq!(unescape_characters("a\\nb"), "a\nb");
        assert_eq!(unescape_characters("a\\\\b"), "a\\b");
        assert_eq!(unescape_characters("a\\\nb"), "ab");
        assert_eq!(unescape_characters("a\\zb"), "azb");
        assert_eq!(unescape_characters("trailing\\"), "trailing\\");
    }

    #[test]
    fn unquoted_escape_table() {
        assert_eq!(escape_unquoted("a (b) 'c'"), "a\\ \\(b\\)\\ \\'c\\'");
        assert_eq!(escape_unquoted("tab\there"), "tab\\there");
    }
}
