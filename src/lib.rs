//! Posts ingest library.
//!
//! Pulls every page of a paginated posts API, derives a word count from each
//! post's HTML content, and upserts the posts into a SQLite table so that
//! repeated or overlapping runs converge on the same rows.

// Allow raw string hashes for safety - they're harmless and prevent issues if content changes
#![allow(clippy::needless_raw_string_hashes)]

pub mod api;
mod backoff;
pub mod config;
pub mod constants;
pub mod db;
pub mod pipeline;
pub mod transform;
