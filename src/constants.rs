//! Shared constants used across the application.

/// Upstream posts endpoint used when `API_URL` is not set.
pub const DEFAULT_API_URL: &str = "https://www.techinasia.com/wp-json/techinasia/2.0/posts";

/// User agent sent with every upstream request.
pub const DEFAULT_USER_AGENT: &str = "PostmanRuntime/7.38.0";

/// Error code the upstream API returns for an out-of-range `page` parameter.
pub const INVALID_PARAM_CODE: &str = "rest_invalid_param";
