use std::collections::BTreeMap;

use tether_core::ResourceId;

use crate::storage::ResourceRecord;

#[derive(Debug, Clone)]
enum Entry {
    Writing(ResourceId),
    Cached(ResourceRecord),
}

/// Scripts written for one version, keyed by URL.
///
/// An entry is `Writing` while its body store write is outstanding and
/// becomes a [`ResourceRecord`] once the size is known.
#[derive(Debug, Clone, Default)]
pub struct ScriptCache {
    entries: BTreeMap<String, Entry>,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the URL already has an entry.
    pub fn started_caching(&mut self, url: &str, resource_id: ResourceId) -> bool {
        if self.entries.contains_key(url) {
            return false;
        }
        self.entries
            .insert(url.to_string(), Entry::Writing(resource_id));
        true
    }

    pub fn finished_caching(&mut self, resource_id: ResourceId, size_bytes: u64) -> bool {
        let Some((url, entry)) = self
            .entries
            .iter_mut()
            .find(|(_, e)| matches!(e, Entry::Writing(id) if *id == resource_id))
        else {
            return false;
        };
        *entry = Entry::Cached(ResourceRecord {
            resource_id,
            url: url.clone(),
            size_bytes,
        });
        true
    }

    /// Drops a pending write, returning its URL.
    pub fn failed_caching(&mut self, resource_id: ResourceId) -> Option<String> {
        let url = self
            .entries
            .iter()
            .find(|(_, e)| matches!(e, Entry::Writing(id) if *id == resource_id))
            .map(|(url, _)| url.clone())?;
        self.entries.remove(&url);
        Some(url)
    }

    pub fn has_url(&self, url: &str) -> bool {
        self.entries.contains_key(url)
    }

    pub fn is_writing(&self) -> bool {
        self.entries.values().any(|e| matches!(e, Entry::Writing(_)))
    }

    /// Finished records, in resource id order.
    pub fn resources(&self) -> Vec<ResourceRecord> {
        let mut out: Vec<ResourceRecord> = self
            .entries
            .values()
            .filter_map(|e| match e {
                Entry::Cached(r) => Some(r.clone()),
                Entry::Writing(_) => None,
            })
            .collect();
        out.sort_by_key(|r| r.resource_id);
        out
    }

    pub fn set_resources(&mut self, resources: Vec<ResourceRecord>) {
        self.entries = resources
            .into_iter()
            .map(|r| (r.url.clone(), Entry::Cached(r)))
            .collect();
    }

    /// Every id the cache knows about, written or not.
    pub fn resource_ids(&self) -> Vec<ResourceId> {
        let mut ids: Vec<ResourceId> = self
            .entries
            .values()
            .map(|e| match e {
                Entry::Writing(id) => *id,
                Entry::Cached(r) => r.resource_id,
            })
            .collect();
        ids.sort();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAIN: &str = "https://a.test/sw.js";

    #[test]
    fn script_counts_only_once_written() {
        let mut cache = ScriptCache::new();
        assert!(cache.started_caching(MAIN, ResourceId(4)));
        assert!(cache.is_writing());
        assert!(cache.resources().is_empty());

        assert!(cache.finished_caching(ResourceId(4), 120));
        assert!(!cache.is_writing());
        assert_eq!(
            cache.resources(),
            vec![ResourceRecord {
                resource_id: ResourceId(4),
                url: MAIN.to_string(),
                size_bytes: 120,
            }]
        );
    }

    #[test]
    fn duplicate_url_is_refused() {
        let mut cache = ScriptCache::new();
        assert!(cache.started_caching("https://a.test/lib.js", ResourceId(1)));
        assert!(!cache.started_caching("https://a.test/lib.js", ResourceId(2)));
        assert_eq!(cache.resource_ids(), vec![ResourceId(1)]);
    }

    #[test]
    fn failed_write_is_forgotten() {
        let mut cache = ScriptCache::new();
        cache.started_caching(MAIN, ResourceId(9));
        assert_eq!(cache.failed_caching(ResourceId(9)).as_deref(), Some(MAIN));
        assert!(cache.resource_ids().is_empty());
        assert!(!cache.finished_caching(ResourceId(9), 1));
    }
}
