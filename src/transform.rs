//! Raw post → storage-ready record.
//!
//! The only derived value is `word_count`: the markup in `content` is reduced
//! to plain text and split on whitespace. Everything here is total; malformed
//! markup is parsed best-effort by html5ever and never produces an error.

use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html};

use crate::api::RawPost;

// Comments and raw-text elements are matched first so a `<body` inside them
// is never taken for a tag.
static BODY_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>|(?P<tag><body(?:[\s/][^>]*)?>)")
        .expect("Invalid body open regex")
});
static BODY_CLOSE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)<!--.*?-->|<script\b.*?</script\s*>|<style\b.*?</style\s*>|(?P<tag></body\s*>)")
        .expect("Invalid body close regex")
});

/// Elements whose contents are code or inert markup, not readable text.
const NON_TEXT_ELEMENTS: [&str; 3] = ["script", "style", "template"];

/// A post ready to be written to the destination table.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageRecord {
    pub post: RawPost,
    pub word_count: u32,
}

impl StorageRecord {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.post.id
    }
}

/// Attach the derived word count to a post.
#[must_use]
pub fn to_storage(post: RawPost) -> StorageRecord {
    let word_count = count_words(post.content.as_deref());
    StorageRecord { post, word_count }
}

/// Number of whitespace-separated words in the text of `content`.
///
/// Absent content counts as zero words.
#[must_use]
pub fn count_words(content: Option<&str>) -> u32 {
    match content {
        Some(markup) if !markup.trim().is_empty() => {
            extract_text(markup).split_whitespace().count() as u32
        }
        _ => 0,
    }
}

/// Plain text of a piece of markup, text nodes joined by single spaces.
///
/// When the markup has an explicit `<body>` tag, only what lies between it and
/// the matching `</body>` (or the end of input) is kept; otherwise the whole
/// input is treated as a body fragment. Text inside `script`, `style` and
/// `template` elements is not counted.
#[must_use]
pub fn extract_text(markup: &str) -> String {
    let scope = explicit_body(markup).unwrap_or(markup);
    let fragment = Html::parse_fragment(scope);
    visible_text(fragment.root_element())
}

/// Contents of the first explicit `<body>` element, if the markup has one.
///
/// html5ever would fold text found before `<body>` into the body, so the
/// element is cut out of the raw markup instead.
fn explicit_body(markup: &str) -> Option<&str> {
    let open = BODY_OPEN
        .captures_iter(markup)
        .find_map(|captures| captures.name("tag"))?;
    if open.as_str().ends_with("/>") {
        return Some("");
    }

    let rest = &markup[open.end()..];
    let end = BODY_CLOSE
        .captures_iter(rest)
        .find_map(|captures| captures.name("tag"))
        .map_or(rest.len(), |close| close.start());
    Some(&rest[..end])
}

fn visible_text(root: ElementRef<'_>) -> String {
    root.descendants()
        .filter_map(|node| node.value().as_text().map(|text| (node, text)))
        .filter(|(node, _)| {
            !node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|element| NON_TEXT_ELEMENTS.contains(&element.name()))
            })
        })
        .map(|(_, text)| &**text)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Parse an upstream GMT timestamp.
///
/// Accepts RFC 3339 with an offset, or a naive `YYYY-MM-DDTHH:MM:SS[.fff]`
/// (also with a space separator) which is taken as UTC.
#[must_use]
pub fn parse_gmt_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}
