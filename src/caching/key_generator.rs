//! # Cache Key Generator
//!
//! Cache keys follow the `{operation}:{owner}:{discriminator}` convention so that
//! `owner_prefix(operation, owner)` addresses every variant cached for one owner.
//! The same keys double as deduplication keys.
//!
//! Components are escaped so an owner id containing `:` can never make one
//! owner's prefix match another owner's keys.

use super::{CacheError, CacheResult};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;

/// Separator between key components
pub const SEPARATOR: char = ':';

/// A cache key built from an operation name, an owner and a discriminator
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    /// Create a key such as `daily_orders:owner-7:2024-05-01`
    pub fn new(operation: &str, owner: &str, discriminator: &str) -> Self {
        Self(format!(
            "{}{}",
            Self::owner_prefix(operation, owner),
            escape_component(discriminator)
        ))
    }

    /// Create a key whose discriminator is the fingerprint of `params`
    pub fn fingerprinted<P: Serialize + ?Sized>(operation: &str, owner: &str, params: &P) -> CacheResult<Self> {
        Ok(Self::new(operation, owner, &fingerprint(params)?))
    }

    /// Prefix shared by every key of `operation` for `owner`, trailing separator included
    pub fn owner_prefix(operation: &str, owner: &str) -> String {
        format!(
            "{}{}{}{}",
            escape_component(operation),
            SEPARATOR,
            escape_component(owner),
            SEPARATOR
        )
    }

    /// Prefix shared by every key of `operation`
    pub fn operation_prefix(operation: &str) -> String {
        format!("{}{}", escape_component(operation), SEPARATOR)
    }

    /// Keep the key within `max_length` by hashing the discriminator.
    ///
    /// The owner prefix is preserved so prefix invalidation still reaches the key.
    pub fn bounded(self, max_length: usize) -> Self {
        if self.0.len() <= max_length {
            return self;
        }

        let prefix_end = match self.0.match_indices(SEPARATOR).nth(1) {
            Some((index, _)) => index + 1,
            None => 0,
        };
        let (prefix, rest) = self.0.split_at(prefix_end);
        Self(format!("{}h-{}", prefix, hash_hex(rest.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Wrap an already rendered key, e.g. one produced by [`render_template`]
impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key)
    }
}

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Deterministic fingerprint of an operation's parameters.
///
/// Parameters are serialized to JSON with object keys sorted, so two maps with the
/// same content always produce the same fingerprint.
pub fn fingerprint<P: Serialize + ?Sized>(params: &P) -> CacheResult<String> {
    let canonical = canonicalize(serde_json::to_value(params)?);
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(hash_hex(&bytes))
}

/// Sort object keys recursively, independent of the map's iteration order
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            Value::Object(entries.into_iter().map(|(k, v)| (k, canonicalize(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

fn hash_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(&digest[..16])
}

/// Escape a single key component so it contains no separator
pub fn escape_component(component: &str) -> String {
    if !component.contains(&['%', SEPARATOR][..]) {
        return component.to_string();
    }
    component.replace('%', "%25").replace(SEPARATOR, "%3A")
}

/// Render a key template such as `daily_orders:{owner_id}:{today}`.
///
/// `{today}` is replaced with `today`; every other `{field}` is looked up in the
/// payload (strings, numbers and booleans only) and escaped like a key component.
pub fn render_template(template: &str, payload: &Value, today: &str) -> CacheResult<String> {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('{') {
        result.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        let end = after.find('}').ok_or_else(|| CacheError::InvalidKey {
            message: format!("Unclosed placeholder in template '{}'", template),
        })?;
        let field = &after[..end];

        if field == "today" {
            result.push_str(today);
        } else {
            let value = match payload.get(field) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                _ => {
                    return Err(CacheError::InvalidKey {
                        message: format!("Template '{}' needs payload field '{}'", template, field),
                    })
                }
            };
            result.push_str(&escape_component(&value));
        }

        rest = &after[end + 1..];
    }
    result.push_str(rest);

    Ok(result)
}
