//! Deriving cache keys from query variables.
//!
//! Query variables are never compared by identity. Two sets of variables address the same cache
//! entry exactly when their [`CacheKey`]s are equal, so a [`KeyDeriver`] must produce the same key
//! for semantically equal variables and distinct keys for everything else.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::KeyError;

/// The canonical string form of a set of query variables.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(Arc<str>);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CacheKey {
    fn from(key: String) -> Self {
        Self(key.into())
    }
}

impl From<&str> for CacheKey {
    fn from(key: &str) -> Self {
        Self(key.into())
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheKey").field(&&*self.0).finish()
    }
}

/// Turns query variables into a [`CacheKey`].
///
/// Implementations must be pure and deterministic.
pub trait KeyDeriver<V: ?Sized>: Send + Sync + 'static {
    fn key_of(&self, variables: &V) -> Result<CacheKey, KeyError>;
}

/// The default [`KeyDeriver`], rendering variables as canonical JSON.
///
/// Variables are serialized with `serde_json`, then written out compactly with the keys of every
/// object sorted. The order in which fields are declared or maps are populated therefore never
/// changes the key.
///
/// Owned Rust values with derived `Serialize` implementations cannot be cyclic. To still have
/// defined behavior for hand-written implementations that recurse without end, nesting is
/// bounded by [`max_depth`](Self::with_max_depth).
#[derive(Clone, Copy, Debug)]
pub struct CanonicalJson {
    max_depth: usize,
}

impl CanonicalJson {
    pub const DEFAULT_MAX_DEPTH: usize = 32;

    pub fn with_max_depth(max_depth: usize) -> Self {
        Self { max_depth }
    }
}

impl Default for CanonicalJson {
    fn default() -> Self {
        Self::with_max_depth(Self::DEFAULT_MAX_DEPTH)
    }
}

impl<V: Serialize + ?Sized> KeyDeriver<V> for CanonicalJson {
    fn key_of(&self, variables: &V) -> Result<CacheKey, KeyError> {
        let value = serde_json::to_value(variables)?;
        let mut out = String::new();
        write_canonical(&value, 0, self.max_depth, &mut out)?;
        Ok(out.into())
    }
}

fn write_canonical(
    value: &Value,
    depth: usize,
    max_depth: usize,
    out: &mut String,
) -> Result<(), KeyError> {
    match value {
        Value::Array(items) => {
            if depth >= max_depth {
                return Err(KeyError::TooDeep { max_depth });
            }
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, depth + 1, max_depth, out)?;
            }
            out.push(']');
        }
        Value::Object(map) => {
            if depth >= max_depth {
                return Err(KeyError::TooDeep { max_depth });
            }
            let mut fields: Vec<_> = map.iter().collect();
            fields.sort_unstable_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (name, item)) in fields.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(name)?);
                out.push(':');
                write_canonical(item, depth + 1, max_depth, out)?;
            }
            out.push('}');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}

/// A [`KeyDeriver`] backed by a plain function.
#[derive(Clone, Copy, Debug)]
pub struct KeyFn<F>(F);

/// Uses `f` to derive cache keys.
pub fn key_fn<V, F>(f: F) -> KeyFn<F>
where
    V: ?Sized,
    F: Fn(&V) -> String + Send + Sync + 'static,
{
    KeyFn(f)
}

impl<V, F> KeyDeriver<V> for KeyFn<F>
where
    V: ?Sized,
    F: Fn(&V) -> String + Send + Sync + 'static,
{
    fn key_of(&self, variables: &V) -> Result<CacheKey, KeyError> {
        Ok((self.0)(variables).into())
    }
}
