//! Cache key definitions.
//!
//! Defines `KeyPart` for caller-supplied keys and namespaces, and the
//! derivation of backend keys from them.

use std::fmt;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::error::CacheError;

/// Bumping this invalidates every derived key written by older builds.
const KEY_VERSION: &str = "v1";
const DEPENDENCY_VERSION: &str = "v1:dependency";

/// Longest key the memcache protocol accepts.
pub const MAX_KEY_LEN: usize = 250;

/// A key or namespace supplied by a caller.
///
/// Derived keys may be built from any JSON value; raw keys must be strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPart(Value);

impl KeyPart {
    /// Build a key part from any serializable value.
    pub fn from_serialize<T: Serialize>(value: &T) -> Result<Self, CacheError> {
        Ok(Self(serde_json::to_value(value)?))
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// Text form: strings as-is, other values as JSON.
    pub fn label(&self) -> String {
        match &self.0 {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl From<&str> for KeyPart {
    fn from(value: &str) -> Self {
        Self(Value::String(value.to_string()))
    }
}

impl From<String> for KeyPart {
    fn from(value: String) -> Self {
        Self(Value::String(value))
    }
}

impl From<&String> for KeyPart {
    fn from(value: &String) -> Self {
        Self(Value::String(value.clone()))
    }
}

impl From<i64> for KeyPart {
    fn from(value: i64) -> Self {
        Self(Value::from(value))
    }
}

impl From<u64> for KeyPart {
    fn from(value: u64) -> Self {
        Self(Value::from(value))
    }
}

impl From<i32> for KeyPart {
    fn from(value: i32) -> Self {
        Self(Value::from(value))
    }
}

impl From<Value> for KeyPart {
    fn from(value: Value) -> Self {
        Self(value)
    }
}

/// Derive the backend key for `key` within namespace `ns`.
///
/// The pair is encoded as the JSON array `[version, ns, key]`, which is
/// unambiguous for distinct pairs, then hashed with SHA-256 so the result
/// is always a 64 character memcache-safe key.
pub fn derive(ns: Option<&KeyPart>, key: &KeyPart) -> String {
    let ns = ns.map(KeyPart::as_value).unwrap_or(&Value::Null);
    let encoded = Value::Array(vec![
        Value::String(KEY_VERSION.to_string()),
        ns.clone(),
        key.as_value().clone(),
    ]);
    hash_hex(encoded.to_string().as_bytes())
}

/// Backend key holding the list of keys carrying dependency `tag`.
pub fn dependency_index_key(tag: &str) -> String {
    let encoded = Value::Array(vec![
        Value::String(DEPENDENCY_VERSION.to_string()),
        Value::String(tag.to_string()),
    ]);
    hash_hex(encoded.to_string().as_bytes())
}

/// Validate the parts of a raw-mode call and return the verbatim backend key.
pub fn raw_key(ns: Option<&KeyPart>, key: &KeyPart) -> Result<String, CacheError> {
    let Some(text) = key.as_str() else {
        return Err(CacheError::invalid_argument(format!(
            "raw keys must be strings, got `{key}`"
        )));
    };
    if let Some(ns) = ns
        && ns.as_str().is_none()
    {
        return Err(CacheError::invalid_argument(format!(
            "raw namespaces must be strings, got `{ns}`"
        )));
    }
    validate_backend_key(text)?;
    Ok(text.to_string())
}

/// Memcache keys are 1..=250 bytes without whitespace or control characters.
pub fn validate_backend_key(key: &str) -> Result<(), CacheError> {
    if key.is_empty() {
        return Err(CacheError::invalid_argument("cache keys must not be empty"));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(CacheError::invalid_argument(format!(
            "cache keys must not exceed {MAX_KEY_LEN} bytes"
        )));
    }
    if key.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(CacheError::invalid_argument(
            "cache keys must not contain whitespace or control characters",
        ));
    }
    Ok(())
}

fn hash_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
