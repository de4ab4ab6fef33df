//! Canonical cache keys for requests.

use serde_json::Value;
use std::collections::BTreeMap;

use super::types::RequestParams;

/// Derive the cache key for a request.
///
/// The method is uppercased and the URL lowercased. Parameters whose value is
/// `null` are dropped; the rest are serialized as JSON sorted by name and
/// appended, so `GET:/a:{"x":1,"y":2}` comes out the same for any parameter order.
pub fn generate_key(method: &str, url: &str, params: Option<&RequestParams>) -> String {
  let method = method.to_uppercase();
  let url = url.to_lowercase();

  let present: BTreeMap<&str, &Value> = params
    .into_iter()
    .flatten()
    .filter(|(_, value)| !value.is_null())
    .map(|(name, value)| (name.as_str(), value))
    .collect();

  if present.is_empty() {
    return format!("{}:{}", method, url);
  }

  // Map keys are strings, so serialization cannot fail
  let params = serde_json::to_string(&present).unwrap_or_default();
  format!("{}:{}:{}", method, url, params)
}
