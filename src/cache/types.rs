//! Data model for cached responses and queued writes.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

use super::key::generate_key;

/// Query parameters attached to a request. `Value::Null` means "unset".
pub type RequestParams = BTreeMap<String, Value>;

/// Request headers carried by queued writes.
pub type RequestHeaders = BTreeMap<String, String>;

/// Whether a request only reads remote state or mutates it.
///
/// Decided once when a descriptor is built; the store only ever looks at this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestIntent {
  Read,
  Write,
}

impl RequestIntent {
  /// Classify an HTTP method. Only safe methods are cacheable reads.
  pub fn from_method(method: &str) -> Self {
    match method.trim().to_ascii_uppercase().as_str() {
      "GET" | "HEAD" | "OPTIONS" => Self::Read,
      _ => Self::Write,
    }
  }
}

/// Freshness class chosen by the caller for a cacheable response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlClass {
  Short,
  Medium,
  Long,
}

impl std::str::FromStr for TtlClass {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "short" => Ok(Self::Short),
      "medium" => Ok(Self::Medium),
      "long" => Ok(Self::Long),
      other => Err(eyre!("Unknown TTL class: {}", other)),
    }
  }
}

/// Everything the cache needs to know about an outgoing request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDescriptor {
  method: String,
  url: String,
  params: Option<RequestParams>,
  body: Option<Vec<u8>>,
  headers: Option<RequestHeaders>,
  intent: RequestIntent,
}

impl RequestDescriptor {
  pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
    let method = method.into();
    let intent = RequestIntent::from_method(&method);
    Self {
      method,
      url: url.into(),
      params: None,
      body: None,
      headers: None,
      intent,
    }
  }

  pub fn get(url: impl Into<String>) -> Self {
    Self::new("GET", url)
  }

  pub fn post(url: impl Into<String>) -> Self {
    Self::new("POST", url)
  }

  pub fn put(url: impl Into<String>) -> Self {
    Self::new("PUT", url)
  }

  pub fn delete(url: impl Into<String>) -> Self {
    Self::new("DELETE", url)
  }

  pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
    self
      .params
      .get_or_insert_with(BTreeMap::new)
      .insert(name.into(), value.into());
    self
  }

  pub fn with_params(mut self, params: RequestParams) -> Self {
    self.params = Some(params);
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_json_body<T: Serialize>(self, body: &T) -> Result<Self> {
    let bytes =
      serde_json::to_vec(body).map_err(|e| eyre!("Failed to serialize request body: {}", e))?;
    Ok(self.with_body(bytes))
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self
      .headers
      .get_or_insert_with(BTreeMap::new)
      .insert(name.into(), value.into());
    self
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn url(&self) -> &str {
    &self.url
  }

  pub fn params(&self) -> Option<&RequestParams> {
    self.params.as_ref()
  }

  pub fn body(&self) -> Option<&[u8]> {
    self.body.as_deref()
  }

  pub fn headers(&self) -> Option<&RequestHeaders> {
    self.headers.as_ref()
  }

  pub fn intent(&self) -> RequestIntent {
    self.intent
  }

  /// Canonical cache key for this request.
  pub fn cache_key(&self) -> String {
    generate_key(&self.method, &self.url, self.params.as_ref())
  }
}

/// A cached response. Replaced wholesale when the same key is stored again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub method: String,
  pub url: String,
  pub params: Option<RequestParams>,
  pub payload: Vec<u8>,
  /// Milliseconds since the Unix epoch
  pub stored_at: i64,
  /// Milliseconds since the Unix epoch, always after `stored_at`
  pub expires_at: i64,
  pub(crate) intent: RequestIntent,
}

impl CacheEntry {
  /// Build an entry for a response to `request`, stored at `stored_at` and living for `ttl`.
  pub fn for_response(
    request: &RequestDescriptor,
    payload: impl Into<Vec<u8>>,
    stored_at: i64,
    ttl: Duration,
  ) -> Self {
    let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
    Self {
      key: request.cache_key(),
      method: request.method.to_uppercase(),
      url: request.url.clone(),
      params: request.params.clone(),
      payload: payload.into(),
      stored_at,
      expires_at: stored_at.saturating_add(ttl_ms),
      intent: request.intent,
    }
  }

  pub fn intent(&self) -> RequestIntent {
    self.intent
  }

  /// Expired once `now` has moved past `expires_at`.
  pub fn is_expired(&self, now: i64) -> bool {
    self.expires_at < now
  }

  /// Decode the payload as JSON.
  pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
    serde_json::from_slice(&self.payload)
      .map_err(|e| eyre!("Failed to decode cached payload for {}: {}", self.key, e))
  }
}

/// A write that could not be delivered and waits for replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
  /// Unique, strictly increasing; replay order
  pub id: i64,
  pub method: String,
  pub url: String,
  pub body: Option<Vec<u8>>,
  pub headers: Option<RequestHeaders>,
  pub enqueued_at: i64,
  pub retry_count: u32,
}

impl QueueEntry {
  /// Rebuild the original request for replay.
  pub fn to_request(&self) -> RequestDescriptor {
    let mut request = RequestDescriptor::new(self.method.clone(), self.url.clone());
    request.body = self.body.clone();
    request.headers = self.headers.clone();
    request
  }
}

/// A queued write that exhausted its replay attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
  pub entry: QueueEntry,
  pub failed_at: i64,
}

/// Result of an insert into the offline queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueReceipt {
  pub id: i64,
  /// Ids of older writes dropped to stay under the soft cap
  pub dropped: Vec<i64>,
}

/// What happened to a queued write after a failed replay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
  /// Back to pending with the given retry count
  Retrying { retry_count: u32 },
  /// Moved to the dead-letter table
  DeadLettered { retry_count: u32 },
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn intent_is_decided_from_method() {
    assert_eq!(RequestDescriptor::get("/a").intent(), RequestIntent::Read);
    assert_eq!(RequestDescriptor::new("head", "/a").intent(), RequestIntent::Read);
    assert_eq!(RequestDescriptor::post("/a").intent(), RequestIntent::Write);
    assert_eq!(RequestDescriptor::new("patch", "/a").intent(), RequestIntent::Write);
  }

  #[test]
  fn entry_expiry_is_after_store_time() {
    let request = RequestDescriptor::get("/bookings");
    let entry = CacheEntry::for_response(&request, b"[]".to_vec(), 1_000, Duration::ZERO);
    assert!(entry.expires_at > entry.stored_at);

    let entry = CacheEntry::for_response(&request, b"[]".to_vec(), 1_000, Duration::from_secs(1));
    assert_eq!(entry.expires_at, 2_000);
    assert!(!entry.is_expired(2_000));
    assert!(entry.is_expired(2_001));
  }

  #[test]
  fn queue_entry_round_trips_to_request() {
    let entry = QueueEntry {
      id: 1,
      method: "POST".to_string(),
      url: "/reviews".to_string(),
      body: Some(b"{}".to_vec()),
      headers: Some(BTreeMap::from([("x-trace".to_string(), "1".to_string())])),
      enqueued_at: 1,
      retry_count: 0,
    };
    let request = entry.to_request();
    assert_eq!(request.intent(), RequestIntent::Write);
    assert_eq!(request.body(), Some(&b"{}"[..]));
    assert_eq!(request.headers().unwrap()["x-trace"], "1");
  }

  #[test]
  fn ttl_class_parses_case_insensitively() {
    assert_eq!("Short".parse::<TtlClass>().unwrap(), TtlClass::Short);
    assert!("forever".parse::<TtlClass>().is_err());
  }
}
