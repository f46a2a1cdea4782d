use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer};
use serde_json::Value;
use tracing::warn;

use crate::constants::INVALID_PARAM_CODE;
use crate::transform::parse_gmt_timestamp;

/// Body of a successful posts listing.
#[derive(Debug, Default, Deserialize)]
pub struct PageBody {
    /// Raw post objects; `None` when the key is absent.
    #[serde(default)]
    pub posts: Option<Vec<Value>>,
    /// Declared page count; `None` when absent or not a number.
    #[serde(default, deserialize_with = "lenient_page_count")]
    pub total_pages: Option<u32>,
}

/// Error body returned by the API, WordPress REST style.
#[derive(Debug, Default, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl ApiErrorBody {
    /// Whether this is the "invalid `page` parameter" error that marks the
    /// end of real data.
    #[must_use]
    pub fn is_invalid_page(&self) -> bool {
        self.code.as_deref() == Some(INVALID_PARAM_CODE)
            && self
                .data
                .pointer("/params/page")
                .is_some_and(Value::is_string)
    }
}

/// Check a decoded response body for the end-of-pages signal.
#[must_use]
pub fn is_invalid_page_signal(body: &Value) -> bool {
    body.is_object()
        && ApiErrorBody::deserialize(body).is_ok_and(|error| error.is_invalid_page())
}

/// One content item as published by the upstream API.
///
/// Nested documents whose shape belongs to the upstream (author, SEO data,
/// categorization...) stay as opaque JSON values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RawPost {
    #[serde(deserialize_with = "identifier")]
    pub id: String,
    #[serde(deserialize_with = "gmt_timestamp")]
    pub date_gmt: DateTime<Utc>,
    #[serde(deserialize_with = "gmt_timestamp")]
    pub modified_gmt: DateTime<Utc>,
    #[serde(deserialize_with = "text")]
    pub title: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub slug: Option<String>,
    #[serde(deserialize_with = "text")]
    pub status: String,
    #[serde(rename = "type", deserialize_with = "text")]
    pub post_type: String,
    #[serde(deserialize_with = "text")]
    pub link: String,
    #[serde(default, deserialize_with = "optional_text")]
    pub content: Option<String>,
    #[serde(default, deserialize_with = "optional_text")]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub author: Value,
    #[serde(default, deserialize_with = "optional_text")]
    pub editor: Option<String>,
    #[serde(deserialize_with = "text")]
    pub comment_status: String,
    #[serde(default, deserialize_with = "count")]
    pub comments_count: i32,
    #[serde(default)]
    pub comments: Value,
    #[serde(default)]
    pub featured_image: Value,
    #[serde(default)]
    pub post_images: Value,
    #[serde(default)]
    pub seo: Value,
    #[serde(default)]
    pub categories: Value,
    #[serde(default)]
    pub tags: Value,
    #[serde(default)]
    pub companies: Value,
    #[serde(default, deserialize_with = "flag")]
    pub is_sponsored: bool,
    #[serde(default)]
    pub sponsor: Value,
    #[serde(default, deserialize_with = "flag")]
    pub is_partnership: bool,
    #[serde(default, deserialize_with = "optional_text")]
    pub external_scripts: Option<String>,
    #[serde(default = "default_true", deserialize_with = "flag_default_true")]
    pub show_ads: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_subscriber_exclusive: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_paywalled: bool,
    #[serde(default, deserialize_with = "flag")]
    pub is_inappbrowser: bool,
    #[serde(default, deserialize_with = "count")]
    pub read_time: i32,
}

/// Decode the raw records of one page, skipping any that do not describe a post.
///
/// Returns the decoded posts and the number of records that were skipped.
#[must_use]
pub fn decode_posts(page: u32, records: Vec<Value>) -> (Vec<RawPost>, usize) {
    let mut posts = Vec::with_capacity(records.len());
    let mut skipped = 0;

    for (index, record) in records.into_iter().enumerate() {
        let id = record.get("id").map(ToString::to_string);
        match serde_json::from_value::<RawPost>(record) {
            Ok(post) => posts.push(post),
            Err(e) => {
                skipped += 1;
                warn!(
                    page,
                    index,
                    id = id.as_deref().unwrap_or("<missing>"),
                    error = %e,
                    "Skipping record that is not a valid post"
                );
            }
        }
    }

    (posts, skipped)
}

const fn default_true() -> bool {
    true
}

fn lenient_page_count<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_u64().map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
        Some(Value::String(s)) => s.trim().parse().ok(),
        _ => None,
    })
}

fn identifier<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) if !s.trim().is_empty() => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(de::Error::custom(format!("invalid post id: {other}"))),
    }
}

fn gmt_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_gmt_timestamp(&raw)
        .ok_or_else(|| de::Error::custom(format!("invalid GMT timestamp: {raw}")))
}

/// Required text; non-string JSON is kept as its serialized form.
fn text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Err(de::Error::custom("expected text, found null")),
        Value::String(s) => Ok(s),
        other => Ok(other.to_string()),
    }
}

fn optional_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

fn count<'de, D>(deserializer: D) -> Result<i32, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_i64()
            .and_then(|n| i32::try_from(n).ok())
            .ok_or_else(|| de::Error::custom(format!("count out of range: {n}"))),
        Value::String(s) => s
            .trim()
            .parse()
            .map_err(|_| de::Error::custom(format!("invalid count: {s}"))),
        other => Err(de::Error::custom(format!("invalid count: {other}"))),
    }
}

fn lenient_flag(value: Value, default: bool) -> Option<bool> {
    match value {
        Value::Null => Some(default),
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_i64().map(|n| n != 0),
        Value::String(s) => match s.to_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let shown = value.to_string();
    lenient_flag(value, false).ok_or_else(|| de::Error::custom(format!("invalid flag: {shown}")))
}

fn flag_default_true<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    let shown = value.to_string();
    lenient_flag(value, true).ok_or_else(|| de::Error::custom(format!("invalid flag: {shown}")))
}
