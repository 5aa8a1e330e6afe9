//! Cache key computation for read requests.
//!
//! A cache key identifies a class of equivalent read requests based on:
//! - The read model scope (e.g. `"account"`)
//! - The aggregate the read model is derived from
//! - The semantically relevant request fields (sorted, hashed)
//!
//! Keys render as `"{scope}/{aggregate_id}/{fingerprint}"`. Everything up to
//! and including the second `/` is the aggregate prefix that commands
//! invalidate after appending events. `/` and `%` inside the scope or the
//! aggregate id are percent-escaped, so `"a"` never prefixes `"a/b"`.

use ahash::AHasher;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Key under which a query result is cached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    /// Compute a key from request components.
    ///
    /// # Arguments
    /// * `scope` - Read model namespace, shared with the aggregate's scope
    /// * `aggregate_id` - Aggregate the read model is derived from
    /// * `fields` - Request fields that change the answer (sorted for consistency)
    pub fn new(
        scope: &str,
        aggregate_id: &str,
        fields: &BTreeMap<Cow<'static, str>, Cow<'static, str>>,
    ) -> Self {
        let mut hasher = AHasher::default();

        // Hash fields in sorted order (BTreeMap guarantees this)
        for (name, value) in fields {
            name.hash(&mut hasher);
            value.hash(&mut hasher);
        }

        CacheKey(format!(
            "{}{:016x}",
            Self::aggregate_prefix(scope, aggregate_id),
            hasher.finish()
        ))
    }

    /// Create a key with no request fields.
    pub fn simple(scope: &str, aggregate_id: &str) -> Self {
        Self::new(scope, aggregate_id, &BTreeMap::new())
    }

    /// Start a key with per-field configuration.
    pub fn builder(scope: &str, aggregate_id: &str) -> CacheKeyBuilder {
        CacheKeyBuilder {
            scope: scope.to_string(),
            aggregate_id: aggregate_id.to_string(),
            fields: BTreeMap::new(),
        }
    }

    /// Prefix shared by every key derived from one aggregate.
    pub fn aggregate_prefix(scope: &str, aggregate_id: &str) -> String {
        format!("{}/{}/", escape_segment(scope), escape_segment(aggregate_id))
    }

    /// The rendered key.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check whether this key belongs under `prefix`.
    pub fn starts_with(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

fn escape_segment(segment: &str) -> Cow<'_, str> {
    if !segment.contains(['/', '%']) {
        return Cow::Borrowed(segment);
    }
    Cow::Owned(segment.replace('%', "%25").replace('/', "%2F"))
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

impl From<CacheKey> for String {
    fn from(key: CacheKey) -> Self {
        key.0
    }
}

/// Incremental construction of a [`CacheKey`].
#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    scope: String,
    aggregate_id: String,
    fields: BTreeMap<Cow<'static, str>, Cow<'static, str>>,
}

impl CacheKeyBuilder {
    /// Add a request field that changes the answer.
    pub fn field(
        mut self,
        name: impl Into<Cow<'static, str>>,
        value: impl Into<Cow<'static, str>>,
    ) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Finish the key.
    pub fn build(self) -> CacheKey {
        CacheKey::new(&self.scope, &self.aggregate_id, &self.fields)
    }
}
