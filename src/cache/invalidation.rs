//! Bulk removal of cached responses by key pattern.

use color_eyre::{eyre::eyre, Result};
use regex::{Regex, RegexBuilder};
use tracing::debug;

use super::layer::ApiCache;
use super::storage::CacheStorage;

/// Which keys an invalidation removes.
#[derive(Debug, Clone)]
pub enum InvalidationPattern {
  /// Keys containing this text, ignoring case
  Literal(String),
  /// Keys matching this expression anywhere
  Compiled(Regex),
}

impl InvalidationPattern {
  pub fn literal(text: impl Into<String>) -> Self {
    Self::Literal(text.into())
  }

  /// Compile a regular expression. A malformed pattern is a caller bug and is returned as an error.
  pub fn regex(pattern: &str) -> Result<Self> {
    Regex::new(pattern)
      .map(Self::Compiled)
      .map_err(|e| eyre!("Invalid invalidation pattern '{}': {}", pattern, e))
  }

  fn compile(&self) -> Result<Regex> {
    match self {
      Self::Literal(text) => RegexBuilder::new(&regex::escape(text))
        .case_insensitive(true)
        .build()
        .map_err(|e| eyre!("Invalid invalidation pattern '{}': {}", text, e)),
      Self::Compiled(re) => Ok(re.clone()),
    }
  }

  pub fn matches(&self, key: &str) -> bool {
    match self {
      Self::Literal(text) => key.to_lowercase().contains(&text.to_lowercase()),
      Self::Compiled(re) => re.is_match(key),
    }
  }
}

impl From<&str> for InvalidationPattern {
  fn from(text: &str) -> Self {
    Self::literal(text)
  }
}

impl From<String> for InvalidationPattern {
  fn from(text: String) -> Self {
    Self::Literal(text)
  }
}

impl From<Regex> for InvalidationPattern {
  fn from(re: Regex) -> Self {
    Self::Compiled(re)
  }
}

/// Delete every entry whose key matches. Full scan; the store is capacity-bounded.
pub(crate) fn invalidate_with<S: CacheStorage>(storage: &S, pattern: &Regex) -> Result<usize> {
  let mut removed = 0;
  for key in storage.keys()? {
    if pattern.is_match(&key) && storage.delete_entry(&key)? {
      removed += 1;
    }
  }
  Ok(removed)
}

impl<S: CacheStorage> ApiCache<S> {
  /// Remove every cached response whose key matches `pattern`.
  ///
  /// Returns the number removed. Only a malformed pattern produces an error;
  /// storage faults are logged and count as nothing removed.
  pub async fn invalidate(&self, pattern: impl Into<InvalidationPattern>) -> Result<usize> {
    let regex = pattern.into().compile()?;
    let shown = regex.as_str().to_string();

    let removed = self
      .run_or_default("invalidate", move |storage| invalidate_with(storage, &regex))
      .await;
    debug!(pattern = %shown, removed, "Invalidated cache entries");

    Ok(removed)
  }

  /// Remove entries whose key matches the regular expression `pattern`.
  pub async fn invalidate_matching(&self, pattern: &str) -> Result<usize> {
    self.invalidate(InvalidationPattern::regex(pattern)?).await
  }
}
