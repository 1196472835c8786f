//! Result caching.
//!
//! Results are cached under keys built from the object key, its version token, the node path,
//! the operation and the MD5 digest of the canonical rendering of every parameter that affects
//! the output. Free-form parts are length-prefixed, so no choice of names can make two distinct
//! requests share a key. The version token of the storage object is part of every key, so
//! replacing an object makes its prior entries unreachable without an explicit sweep.
//!
//! Each [CacheTier] is an [LruCache] holding a bounded number of entries. Lookups use
//! [LruCache::peek] and leave the recency order alone, so the tier evicts the oldest-inserted
//! entry when full. Payloads are cached as serialised JSON [Bytes], so a cached result is immutable and
//! repeated requests are byte-identical.

use crate::metrics::{CACHE_HITS, CACHE_MISSES};
use crate::models::DatasetInfo;

use bytes::Bytes;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::sync::{Mutex, PoisonError};
use strum_macros::Display;

/// Identity of a storage object at a particular version.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct FileIdentity {
    /// Object key
    pub file: String,
    /// Opaque change token
    pub version: String,
}

impl FileIdentity {
    pub fn new(file: &str, version: &str) -> Self {
        FileIdentity {
            file: file.to_string(),
            version: version.to_string(),
        }
    }
}

/// Builds deterministic cache keys.
pub struct CacheKeyBuilder;

/// `{len}:{part}`, which cannot be confused with a neighbouring part whatever it contains.
fn length_prefixed(part: &str) -> String {
    format!("{}:{}", part.len(), part)
}

impl CacheKeyBuilder {
    /// Render parameters canonically, sorted by name.
    pub fn canonical(params: &[(&str, String)]) -> String {
        let mut params: Vec<(&str, &str)> = params
            .iter()
            .map(|(name, value)| (*name, value.trim()))
            .collect();
        params.sort();
        params
            .iter()
            .map(|(name, value)| format!("{}={}", name, length_prefixed(value)))
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Returns the key for an operation on a path of a file.
    ///
    /// # Arguments
    ///
    /// * `identity`: Object key and version token
    /// * `path`: Normalized path inside the container
    /// * `op`: Operation name
    /// * `params`: `(name, value)` pairs rendered from parsed parameters
    pub fn build_key(identity: &FileIdentity, path: &str, op: &str, params: &[(&str, String)]) -> String {
        let digest = md5::compute(Self::canonical(params));
        format!(
            "{}@{}{}#{}:{:x}",
            length_prefixed(&identity.file),
            length_prefixed(&identity.version),
            length_prefixed(path),
            op,
            digest
        )
    }
}

/// Name of a cache tier
#[derive(Clone, Copy, Debug, Display, Eq, Hash, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Tier {
    Children,
    Metadata,
    Dataset,
    Preview,
    Data,
}

/// A bounded map evicting the oldest-inserted entry on overflow.
///
/// One mutex guards each tier. It is held for the lookup or insertion only.
#[derive(Debug)]
pub struct CacheTier<V> {
    tier: Tier,
    /// `None` when caching is disabled
    entries: Option<Mutex<LruCache<String, V>>>,
}

impl<V: Clone> CacheTier<V> {
    /// Create a tier holding at most `capacity` entries. A capacity of zero disables caching.
    pub fn new(tier: Tier, capacity: usize) -> Self {
        CacheTier {
            tier,
            entries: NonZeroUsize::new(capacity).map(|capacity| Mutex::new(LruCache::new(capacity))),
        }
    }

    /// Look up an entry, recording a hit or miss.
    pub fn get(&self, key: &str) -> Option<V> {
        let value = self.entries.as_ref().and_then(|entries| {
            entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .peek(key)
                .cloned()
        });
        let label = self.tier.to_string();
        match value {
            Some(_) => CACHE_HITS.with_label_values(&[&label]).inc(),
            None => CACHE_MISSES.with_label_values(&[&label]).inc(),
        }
        value
    }

    /// Insert an entry. An existing entry is kept along with its position.
    pub fn insert(&self, key: String, value: V) {
        let Some(entries) = &self.entries else {
            return;
        };
        let mut entries = entries.lock().unwrap_or_else(PoisonError::into_inner);
        if !entries.contains(&key) {
            entries.push(key, value);
        }
    }

    /// Number of entries held.
    pub fn len(&self) -> usize {
        self.entries.as_ref().map_or(0, |entries| {
            entries.lock().unwrap_or_else(PoisonError::into_inner).len()
        })
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }
}

/// Capacity of each tier, in entries.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CacheCapacities {
    pub children: usize,
    pub metadata: usize,
    pub dataset: usize,
    pub preview: usize,
    pub data: usize,
}

impl Default for CacheCapacities {
    fn default() -> Self {
        CacheCapacities {
            children: 1024,
            metadata: 1024,
            dataset: 4096,
            preview: 512,
            data: 256,
        }
    }
}

/// The tiered result cache shared by all requests.
#[derive(Debug)]
pub struct Cache {
    /// Group listings
    pub children: CacheTier<Bytes>,
    /// Node metadata
    pub metadata: CacheTier<Bytes>,
    /// Dataset shape and dtype, used to check limits before opening a container
    pub dataset: CacheTier<DatasetInfo>,
    /// Preview payloads
    pub preview: CacheTier<Bytes>,
    /// Matrix, line and heatmap payloads
    pub data: CacheTier<Bytes>,
}

impl Cache {
    pub fn new(capacities: CacheCapacities) -> Self {
        Cache {
            children: CacheTier::new(Tier::Children, capacities.children),
            metadata: CacheTier::new(Tier::Metadata, capacities.metadata),
            dataset: CacheTier::new(Tier::Dataset, capacities.dataset),
            preview: CacheTier::new(Tier::Preview, capacities.preview),
            data: CacheTier::new(Tier::Data, capacities.data),
        }
    }
}

impl Default for Cache {
    fn default() -> Self {
        Self::new(CacheCapacities::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> FileIdentity {
        FileIdentity::new("data.h5", "\"abc\"")
    }

    #[test]
    fn canonical_sorts_and_trims() {
        let params = [("b", " 2".to_string()), ("a", "1 ".to_string())];
        assert_eq!("a=1:1&b=1:2", CacheKeyBuilder::canonical(&params));
        assert_eq!("", CacheKeyBuilder::canonical(&[]));
    }

    #[test]
    fn key_format() {
        let key = CacheKeyBuilder::build_key(&identity(), "/x", "matrix", &[]);
        assert_eq!(
            format!("7:data.h5@5:\"abc\"2:/x#matrix:{:x}", md5::compute("")),
            key
        );
    }

    #[test]
    fn key_separators_in_names_do_not_collide() {
        // Unescaped, both would render as `a@b@c:/x`.
        let first = FileIdentity::new("a@b", "c");
        let second = FileIdentity::new("a", "b@c");
        assert_ne!(
            CacheKeyBuilder::build_key(&first, "/x", "matrix", &[]),
            CacheKeyBuilder::build_key(&second, "/x", "matrix", &[])
        );
        assert_ne!(
            CacheKeyBuilder::build_key(&identity(), "/x:y", "matrix", &[]),
            CacheKeyBuilder::build_key(&FileIdentity::new("data.h5", "\"abc\":/x"), "y", "matrix", &[])
        );
        let joined = [("a", "1&b=2".to_string())];
        let split = [("a", "1".to_string()), ("b", "2".to_string())];
        assert_ne!(
            CacheKeyBuilder::build_key(&identity(), "/x", "matrix", &joined),
            CacheKeyBuilder::build_key(&identity(), "/x", "matrix", &split)
        );
    }

    #[test]
    fn key_ignores_parameter_order() {
        let first = [("row_limit", "10".to_string()), ("col_limit", "5".to_string())];
        let second = [("col_limit", "5".to_string()), ("row_limit", "10".to_string())];
        assert_eq!(
            CacheKeyBuilder::build_key(&identity(), "/x", "matrix", &first),
            CacheKeyBuilder::build_key(&identity(), "/x", "matrix", &second)
        );
    }

    #[test]
    fn key_depends_on_every_component() {
        let params = [("row_limit", "10".to_string())];
        let key = CacheKeyBuilder::build_key(&identity(), "/x", "matrix", &params);
        let other_version = FileIdentity::new("data.h5", "\"def\"");
        assert_ne!(
            key,
            CacheKeyBuilder::build_key(&other_version, "/x", "matrix", &params)
        );
        assert_ne!(
            key,
            CacheKeyBuilder::build_key(&identity(), "/y", "matrix", &params)
        );
        assert_ne!(
            key,
            CacheKeyBuilder::build_key(&identity(), "/x", "line", &params)
        );
        assert_ne!(
            key,
            CacheKeyBuilder::build_key(
                &identity(),
                "/x",
                "matrix",
                &[("row_limit", "11".to_string())]
            )
        );
    }

    #[test]
    fn tier_get_insert() {
        let tier = CacheTier::new(Tier::Data, 2);
        assert!(tier.is_empty());
        assert_eq!(None, tier.get("a"));
        tier.insert("a".to_string(), Bytes::from_static(b"1"));
        assert_eq!(Some(Bytes::from_static(b"1")), tier.get("a"));
        assert_eq!(1, tier.len());
    }

    #[test]
    fn tier_evicts_oldest_inserted() {
        let tier = CacheTier::new(Tier::Preview, 2);
        tier.insert("a".to_string(), 1);
        tier.insert("b".to_string(), 2);
        // Lookups do not refresh an entry's position.
        assert_eq!(Some(1), tier.get("a"));
        tier.insert("c".to_string(), 3);
        assert_eq!(None, tier.get("a"));
        assert_eq!(Some(2), tier.get("b"));
        assert_eq!(Some(3), tier.get("c"));
        assert_eq!(2, tier.len());
    }

    #[test]
    fn tier_reinsert_keeps_position() {
        let tier = CacheTier::new(Tier::Children, 2);
        tier.insert("a".to_string(), 1);
        tier.insert("b".to_string(), 2);
        tier.insert("a".to_string(), 10);
        assert_eq!(Some(1), tier.get("a"));
        tier.insert("c".to_string(), 3);
        assert_eq!(None, tier.get("a"));
        assert_eq!(Some(2), tier.get("b"));
    }

    #[test]
    fn tier_zero_capacity() {
        let tier = CacheTier::new(Tier::Metadata, 0);
        tier.insert("a".to_string(), 1);
        assert_eq!(None, tier.get("a"));
    }

    #[test]
    fn tiers_are_independent() {
        let cache = Cache::new(CacheCapacities {
            data: 1,
            ..Default::default()
        });
        cache.data.insert("k".to_string(), Bytes::from_static(b"data"));
        cache
            .preview
            .insert("k".to_string(), Bytes::from_static(b"preview"));
        cache.data.insert("k2".to_string(), Bytes::from_static(b"data2"));
        assert_eq!(None, cache.data.get("k"));
        assert_eq!(Some(Bytes::from_static(b"preview")), cache.preview.get("k"));
        assert_eq!(Tier::Dataset, cache.dataset.tier());
        assert_eq!("dataset", Tier::Dataset.to_string());
    }
}
