use dashmap::DashMap;

/// Concurrent region → value map used on hot paths from multiple tasks.
///
/// Entries are inserted once at boot and read concurrently thereafter.
/// `DashMap` shards the lock space, so reads never contend on a global
/// mutex. Values are cloned out on load; callers store `Arc`s or channel
/// senders, both of which are cheap to clone.
pub struct RegionMap<T> {
    inner: DashMap<String, T>,
}

impl<T: Clone> RegionMap<T> {
    /// Creates an empty region map.
    pub fn new() -> Self {
        Self {
            inner: DashMap::new(),
        }
    }

    /// Stores a value for the given region, replacing any previous entry.
    pub fn insert(&self, region: impl Into<String>, value: T) {
        self.inner.insert(region.into(), value);
    }

    /// Loads a clone of the value for the given region.
    pub fn load(&self, region: &str) -> Option<T> {
        self.inner.get(region).map(|entry| entry.value().clone())
    }

    /// Returns true if the region has an entry.
    pub fn contains(&self, region: &str) -> bool {
        self.inner.contains_key(region)
    }

    /// Removes the entry for the given region, returning it if present.
    pub fn remove(&self, region: &str) -> Option<T> {
        self.inner.remove(region).map(|(_, value)| value)
    }

    /// Snapshots the set of known regions.
    pub fn regions(&self) -> Vec<String> {
        self.inner.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns true if the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl<T: Clone> Default for RegionMap<T> {
    fn default() -> Self {
        Self::new()
    }
}
