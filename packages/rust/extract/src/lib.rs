//! Main-text extraction from HTML pages.
//!
//! Picks the most specific content region available (`<article>`, then `<main>`,
//! then `<body>`) and flattens it to plain text, skipping scripts, styles and
//! navigation chrome.

mod cleanup;

use scraper::{ElementRef, Html, Node, Selector};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// Page region the text was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Region {
    Article,
    Main,
    Body,
    /// Input had no `<body>` with text; the whole document was flattened.
    Document,
}

/// Result of extracting text from an HTML page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extracted {
    /// Cleaned plain text; empty when the page has no readable content.
    pub text: String,
    pub region: Region,
}

impl Extracted {
    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Elements whose text is never part of the main content.
const SKIPPED_TAGS: &[&str] = &[
    "script", "style", "noscript", "template", "svg", "iframe", "nav", "header", "footer",
    "aside", "form", "button",
];

/// Class names marking navigation chrome.
const SKIPPED_CLASSES: &[&str] = &[
    "nav", "navbar", "navigation", "menu", "sidebar", "footer", "breadcrumb", "breadcrumbs",
];

/// ARIA roles marking navigation chrome.
const SKIPPED_ROLES: &[&str] = &["navigation", "banner", "contentinfo", "complementary"];

/// Elements that start a new line in the flattened output.
const BLOCK_TAGS: &[&str] = &[
    "p", "div", "section", "article", "main", "br", "li", "ul", "ol", "h1", "h2", "h3", "h4",
    "h5", "h6", "pre", "blockquote", "table", "tr", "dl", "dt", "dd", "figure", "figcaption",
];

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

/// Extract the main readable text of an HTML page.
///
/// Regions are tried in order `article`, `main`, `[role=main]`, `body`; a region
/// that flattens to nothing falls through to the next one.
#[instrument(skip(html), fields(html_len = html.len()))]
pub fn extract_text(html: &str) -> Extracted {
    let doc = Html::parse_document(html);

    let regions = [
        ("article", Region::Article),
        ("main", Region::Main),
        ("[role=\"main\"]", Region::Main),
        ("body", Region::Body),
    ];

    for (sel_str, region) in regions {
        let Ok(selector) = Selector::parse(sel_str) else {
            continue;
        };
        for el in doc.select(&selector) {
            let text = flatten(el);
            if !text.is_empty() {
                debug!(?region, text_len = text.len(), "extracted content region");
                return Extracted { text, region };
            }
        }
    }

    let text = flatten(doc.root_element());
    debug!(text_len = text.len(), "no content region, flattened document");
    Extracted {
        text,
        region: Region::Document,
    }
}

/// Flatten an element to cleaned text.
fn flatten(el: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_text(el, &mut raw);
    cleanup::run_pipeline(&raw)
}

fn collect_text(el: ElementRef<'_>, out: &mut String) {
    for child in el.children() {
        match child.value() {
            Node::Text(text) => out.push_str(text),
            Node::Element(_) => {
                let Some(child_el) = ElementRef::wrap(child) else {
                    continue;
                };
                if is_boilerplate(child_el) {
                    continue;
                }
                let block = BLOCK_TAGS.contains(&child_el.value().name());
                if block {
                    out.push('\n');
                }
                collect_text(child_el, out);
                if block {
                    out.push('\n');
                }
            }
            _ => {}
        }
    }
}

fn is_boilerplate(el: ElementRef<'_>) -> bool {
    let value = el.value();
    if SKIPPED_TAGS.contains(&value.name()) {
        return true;
    }
    if value.classes().any(|class| {
        SKIPPED_CLASSES
            .iter()
            .any(|skipped| class.eq_ignore_ascii_case(skipped))
    }) {
        return true;
    }
    value
        .attr("role")
        .is_some_and(|role| SKIPPED_ROLES.contains(&role))
}
