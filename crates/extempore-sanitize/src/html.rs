// SPDX-License-Identifier: Apache-2.0

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::Rc;

use html5ever::serialize::{serialize, SerializeOpts};
use html5ever::tendril::{StrTendril, TendrilSink};
use html5ever::{parse_document, ParseOpts};
use markup5ever_rcdom::{Handle, Node, NodeData, RcDom, SerializableHandle};

use crate::css::rewrite_css;
use crate::SanitizeError;

/// Walk bound. Trees deeper than this are rejected by the URL pass and
/// silently truncated by the removal pass.
pub const MAX_DEPTH: usize = 100;

/// Attributes whose value a browser treats as a URL (or a script target).
const URL_ATTRIBUTES: &[&str] = &[
    "src",
    "href",
    "action",
    "data",
    "poster",
    "formaction",
    "cite",
    "background",
    "ping",
    "longdesc",
    "icon",
    "srcdoc",
    "xlink:href",
    "codebase",
    "classid",
    "archive",
    "usemap",
    "profile",
    "manifest",
];

pub fn parse_html(raw: &str) -> RcDom {
    parse_document(RcDom::default(), ParseOpts::default()).one(StrTendril::from(raw))
}

pub fn render_html(root: &Handle) -> Result<Vec<u8>, SanitizeError> {
    let mut out = Vec::new();
    let serializable = SerializableHandle::from(root.clone());
    serialize(&mut out, &serializable, SerializeOpts::default())
        .map_err(|err| SanitizeError::Render(err.to_string()))?;
    Ok(out)
}

/// Rewrite every URL-bearing attribute, `srcset` list, `style` attribute,
/// and `<style>` element body through `map_url`, inserting the mapped values
/// into `urls`.
pub fn rewrite_urls(
    root: &Handle,
    urls: &mut BTreeSet<String>,
    map_url: &dyn Fn(&str) -> String,
) -> Result<(), SanitizeError> {
    walk_rewrite(root, 0, urls, map_url)
}

fn walk_rewrite(
    node: &Handle,
    depth: usize,
    urls: &mut BTreeSet<String>,
    map_url: &dyn Fn(&str) -> String,
) -> Result<(), SanitizeError> {
    if depth > MAX_DEPTH {
        return Err(SanitizeError::MaxDepthExceeded);
    }

    if let NodeData::Element { ref name, ref attrs, .. } = node.data {
        for attr in attrs.borrow_mut().iter_mut() {
            let key = attr.name.local.to_ascii_lowercase();
            match &*key {
                "style" => {
                    let rewritten = rewrite_css(&attr.value, urls, map_url);
                    attr.value = StrTendril::from(rewritten.as_str());
                }
                "srcset" | "imagesrcset" => {
                    let rewritten = rewrite_srcset(&attr.value, urls, map_url);
                    attr.value = StrTendril::from(rewritten.as_str());
                }
                key if URL_ATTRIBUTES.contains(&key) => {
                    let mapped = map_url(&attr.value);
                    urls.insert(mapped.clone());
                    attr.value = StrTendril::from(mapped.as_str());
                }
                _ => {}
            }
        }

        if name.local.as_ref() == "style" {
            rewrite_style_element(node, urls, map_url);
        }
    }

    let children: Vec<Handle> = node.children.borrow().clone();
    for child in &children {
        walk_rewrite(child, depth + 1, urls, map_url)?;
    }
    Ok(())
}

/// A `srcset` value is comma-separated candidates, each a URL followed by an
/// optional descriptor. The URL is rewritten, the descriptor preserved.
fn rewrite_srcset(value: &str, urls: &mut BTreeSet<String>, map_url: &dyn Fn(&str) -> String) -> String {
    let mut out = Vec::new();
    for part in value.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let mut fields = part.split_whitespace();
        let Some(first) = fields.next() else {
            continue;
        };
        let descriptor: Vec<&str> = fields.collect();
        let mapped = map_url(first);
        urls.insert(mapped.clone());
        if descriptor.is_empty() {
            out.push(mapped);
        } else {
            out.push(format!("{mapped} {}", descriptor.join(" ")));
        }
    }
    out.join(", ")
}

fn rewrite_style_element(node: &Handle, urls: &mut BTreeSet<String>, map_url: &dyn Fn(&str) -> String) {
    let mut text = String::new();
    let mut text_children = 0usize;
    let mut other_children = false;
    for child in node.children.borrow().iter() {
        match &child.data {
            NodeData::Text { contents } => {
                text_children += 1;
                text.push_str(&contents.borrow());
            }
            _ => other_children = true,
        }
    }

    if text.is_empty() {
        return;
    }

    let rewritten = rewrite_css(&text, urls, map_url);

    // A lone text child is edited in place; anything else collapses to a
    // single fresh text node.
    if text_children == 1 && !other_children && node.children.borrow().len() == 1 {
        if let NodeData::Text { contents } = &node.children.borrow()[0].data {
            *contents.borrow_mut() = StrTendril::from(rewritten.as_str());
        }
        return;
    }

    let mut children = node.children.borrow_mut();
    for child in children.iter() {
        child.parent.set(None);
    }
    children.clear();
    let replacement = Node::new(NodeData::Text {
        contents: RefCell::new(StrTendril::from(rewritten.as_str())),
    });
    replacement.parent.set(Some(Rc::downgrade(node)));
    children.push(replacement);
}

/// Detach every element whose name matches one of `names`
/// (case-insensitive). Children of a removed element are not visited, and
/// walks deeper than the bound are truncated rather than failed.
pub fn remove_elements(root: &Handle, names: &[&str]) {
    let mut doomed = Vec::new();
    collect_matches(root, 0, names, &mut doomed);
    for node in &doomed {
        detach(node);
    }
}

fn collect_matches(node: &Handle, depth: usize, names: &[&str], doomed: &mut Vec<Handle>) {
    if depth > MAX_DEPTH {
        return;
    }
    if let NodeData::Element { ref name, .. } = node.data {
        if names.iter().any(|n| n.eq_ignore_ascii_case(&name.local)) {
            doomed.push(node.clone());
            return;
        }
    }
    let children: Vec<Handle> = node.children.borrow().clone();
    for child in &children {
        collect_matches(child, depth + 1, names, doomed);
    }
}

fn detach(node: &Handle) {
    if let Some(weak) = node.parent.take() {
        if let Some(parent) = weak.upgrade() {
            parent
                .children
                .borrow_mut()
                .retain(|child| !Rc::ptr_eq(child, node));
        }
    }
}
