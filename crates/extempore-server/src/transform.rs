// SPDX-License-Identifier: Apache-2.0

//! Post-sanitization document transformer: social-card metadata in `<head>`
//! and the warning banner at the top of `<body>`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use html5ever::tendril::StrTendril;
use html5ever::{namespace_url, ns, Attribute, LocalName, QualName};
use markup5ever_rcdom::{Handle, Node, NodeData};

use crate::site::HtmlTransformFn;

/// Slug of the per-site social card image. Registered as a URL on every
/// generated page so it is generated on demand like any other resource.
pub const SOCIAL_CARD_SLUG: &str = "colorful-social-card.jpg";

const BANNER_IFRAME_STYLE: &str = "position: fixed !important; top: 0 !important; \
    left: 0 !important; right: 0 !important; z-index: 999999 !important; \
    border: none !important; height: 80px !important; width: 100% !important;";

const BANNER_SPACER_STYLE: &str = "height: 80px !important; margin: 0 !important; \
    padding: 0 !important; box-sizing: border-box !important;";

/// Build the default per-site transformer. `base_url` makes the social-card
/// references absolute; empty falls back to site-relative.
#[must_use]
pub fn default_transformer(prefix: &str, base_url: &str) -> HtmlTransformFn {
    let trimmed = base_url.trim_end_matches('/').to_string();
    let card_url = format!("{trimmed}/{prefix}/{SOCIAL_CARD_SLUG}");
    let page_url = format!("{trimmed}/{prefix}/");
    let prefix = prefix.to_string();

    Arc::new(move |document, urls| {
        let (head, body) = find_head_and_body(document);

        if let Some(head) = head {
            for (kind, key, value) in [
                ("name", "description", format!("AI-generated content for {prefix}")),
                ("property", "og:image", card_url.clone()),
                ("property", "og:title", prefix.clone()),
                ("property", "og:description", prefix.clone()),
                ("property", "og:url", page_url.clone()),
                ("name", "twitter:card", "summary_large_image".to_string()),
                ("name", "twitter:title", prefix.clone()),
                ("name", "twitter:description", prefix.clone()),
                ("name", "twitter:image", card_url.clone()),
            ] {
                append_child(&head, new_element("meta", &[(kind, key), ("content", &value)]));
            }
        }

        urls.insert(SOCIAL_CARD_SLUG.to_string());

        if let Some(body) = body {
            let iframe = new_element(
                "iframe",
                &[
                    ("src", "/banner.html"),
                    ("title", "AI-generated warning banner and header"),
                    ("style", BANNER_IFRAME_STYLE),
                    ("scrolling", "no"),
                ],
            );
            let spacer = new_element("div", &[("style", BANNER_SPACER_STYLE)]);
            prepend_child(&body, spacer);
            prepend_child(&body, iframe);
        }

        Ok(())
    })
}

fn find_head_and_body(document: &Handle) -> (Option<Handle>, Option<Handle>) {
    let mut head = None;
    let mut body = None;
    walk(document, &mut head, &mut body);
    (head, body)
}

fn walk(node: &Handle, head: &mut Option<Handle>, body: &mut Option<Handle>) {
    if let NodeData::Element { ref name, .. } = node.data {
        match name.local.as_ref() {
            "head" => *head = Some(node.clone()),
            "body" => *body = Some(node.clone()),
            _ => {}
        }
    }
    for child in node.children.borrow().iter() {
        walk(child, head, body);
    }
}

fn new_element(name: &str, attributes: &[(&str, &str)]) -> Handle {
    Node::new(NodeData::Element {
        name: QualName::new(None, ns!(html), LocalName::from(name)),
        attrs: RefCell::new(
            attributes
                .iter()
                .map(|(key, value)| Attribute {
                    name: QualName::new(None, ns!(), LocalName::from(*key)),
                    value: StrTendril::from(*value),
                })
                .collect(),
        ),
        template_contents: RefCell::new(None),
        mathml_annotation_xml_integration_point: false,
    })
}

fn append_child(parent: &Handle, child: Handle) {
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().push(child);
}

fn prepend_child(parent: &Handle, child: Handle) {
    child.parent.set(Some(Rc::downgrade(parent)));
    parent.children.borrow_mut().insert(0, child);
}
