use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};

use super::{LoadError, LoadResult};

/// The key under which an entry is stored in a [`Cache`](super::Cache).
///
/// A key is built from stable, human-readable metadata: either a caller-supplied
/// string, or the canonical serialization of a structured request descriptor. The
/// metadata is SHA-256 hashed, and only the hash is used for equality and map
/// lookups. The metadata itself is kept around for logging and debugging.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.metadata)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] from a caller-supplied string.
    pub fn new(key: impl Into<String>) -> Self {
        let mut builder = CacheKeyBuilder::new(None);
        builder.write_str(&key.into()).unwrap();
        builder.build()
    }

    /// Creates a namespaced [`CacheKey`] from a caller-supplied string.
    ///
    /// Keys with different namespaces never collide, which lets unrelated
    /// resources share one cache instance.
    pub fn scoped(namespace: &str, key: impl Into<String>) -> Self {
        let mut builder = CacheKeyBuilder::new(Some(namespace));
        builder.write_str(&key.into()).unwrap();
        builder.build()
    }

    /// Creates a [`CacheKey`] from a structured request descriptor.
    ///
    /// The descriptor is serialized to canonical JSON: object keys are sorted at
    /// every nesting level, so two descriptors that differ only in field order
    /// produce the same key.
    pub fn from_request<R: Serialize>(namespace: &str, request: &R) -> LoadResult<Self> {
        // `serde_json::Value` maps are backed by a `BTreeMap`, which yields the
        // canonical (sorted) key order when serialized back out.
        let canonical = serde_json::to_value(request)?;
        let json = serde_json::to_string(&canonical)?;

        let mut builder = CacheKeyBuilder::new(Some(namespace));
        builder
            .write_str(&json)
            .map_err(|_| LoadError::InternalError)?;
        Ok(builder.build())
    }

    /// Returns the human-readable metadata that forms the basis of this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// The hex-formatted SHA-256 of the metadata.
    pub fn hash_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for b in &self.hash {
            out.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        out
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention
/// of it is to accept human readable, but most importantly **stable**, input. This
/// input is then hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    pub fn new(namespace: Option<&str>) -> Self {
        let metadata = match namespace {
            Some(ns) => format!("namespace: {ns}\n\n"),
            None => String::new(),
        };
        CacheKeyBuilder { metadata }
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);
        let hash = <[u8; 32]>::try_from(hash.as_slice()).expect("sha256 outputs 32 bytes");

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use serde::Serialize;

    use super::*;

    #[test]
    fn test_key_order_is_canonical() {
        #[derive(Serialize)]
        struct Ab {
            a: u32,
            b: u32,
        }
        #[derive(Serialize)]
        struct Ba {
            b: u32,
            a: u32,
        }

        let ab = CacheKey::from_request("events", &Ab { a: 1, b: 2 }).unwrap();
        let ba = CacheKey::from_request("events", &Ba { b: 2, a: 1 }).unwrap();

        assert_eq!(ab, ba);
        assert_eq!(ab.metadata(), "namespace: events\n\n{\"a\":1,\"b\":2}");
    }

    #[test]
    fn test_namespaces_do_not_collide() {
        let a = CacheKey::scoped("events", "list");
        let b = CacheKey::scoped("attendees", "list");
        assert_ne!(a, b);

        let unscoped = CacheKey::new("list");
        assert_ne!(a, unscoped);
    }

    #[test]
    fn test_equality_is_hash_based() {
        let a = CacheKey::new("list?offset=0");
        let b = CacheKey::new("list?offset=0");
        assert_eq!(a, b);
        assert_eq!(a.hash_hex(), b.hash_hex());
        assert_eq!(a.hash_hex().len(), 64);
    }
}
