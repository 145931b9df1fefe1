//! In-process object store.

use super::{
    partial_path, ListPage, ObjectInfo, ObjectStore, PutOptions, StorageError, StorageResult,
};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
}

/// Object store held in memory, with knobs for failure injection.
///
/// Keys hidden with [`MemoryStore::hide_from_list`] exist (head/get see them)
/// but do not appear in listings, mimicking a lagging index.
#[derive(Debug)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    page_size: usize,
    transient_put_failures: Mutex<HashMap<String, u32>>,
    permanent_put_failures: Mutex<HashSet<String>>,
    hidden_from_list: Mutex<HashSet<String>>,
    puts: AtomicUsize,
    put_attempts: AtomicUsize,
    list_calls: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_page_size(1000)
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            page_size: page_size.max(1),
            transient_put_failures: Mutex::new(HashMap::new()),
            permanent_put_failures: Mutex::new(HashSet::new()),
            hidden_from_list: Mutex::new(HashSet::new()),
            puts: AtomicUsize::new(0),
            put_attempts: AtomicUsize::new(0),
            list_calls: AtomicUsize::new(0),
        }
    }

    fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Store an object directly, bypassing counters and failure injection.
    pub fn insert(&self, key: impl Into<String>, data: Vec<u8>) {
        Self::lock(&self.objects).insert(
            key.into(),
            StoredObject {
                data,
                content_type: None,
                cache_control: None,
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        Self::lock(&self.objects).get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        Self::lock(&self.objects).contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        Self::lock(&self.objects).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        Self::lock(&self.objects).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fail the next `times` uploads of `key`.
    pub fn fail_put_times(&self, key: impl Into<String>, times: u32) {
        Self::lock(&self.transient_put_failures).insert(key.into(), times);
    }

    /// Fail every upload of `key`.
    pub fn fail_put_always(&self, key: impl Into<String>) {
        Self::lock(&self.permanent_put_failures).insert(key.into());
    }

    pub fn clear_failures(&self) {
        Self::lock(&self.transient_put_failures).clear();
        Self::lock(&self.permanent_put_failures).clear();
    }

    pub fn hide_from_list(&self, key: impl Into<String>) {
        Self::lock(&self.hidden_from_list).insert(key.into());
    }

    /// Successful uploads since creation or the last [`reset_counters`](Self::reset_counters).
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    /// Upload attempts, failed ones included.
    pub fn put_attempts(&self) -> usize {
        self.put_attempts.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn reset_counters(&self) {
        self.puts.store(0, Ordering::SeqCst);
        self.put_attempts.store(0, Ordering::SeqCst);
        self.list_calls.store(0, Ordering::SeqCst);
    }

    fn injected_failure(&self, key: &str) -> bool {
        if Self::lock(&self.permanent_put_failures).contains(key) {
            return true;
        }
        let mut transient = Self::lock(&self.transient_put_failures);
        match transient.get_mut(key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_page(&self, prefix: &str, token: Option<String>) -> StorageResult<ListPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let hidden = Self::lock(&self.hidden_from_list).clone();
        let objects = Self::lock(&self.objects);

        // token is the last key of the previous page
        let mut matching = objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix) && !hidden.contains(*k))
            .filter(|(k, _)| token.as_deref().map_or(true, |t| k.as_str() > t));

        let page: Vec<ObjectInfo> = matching
            .by_ref()
            .take(self.page_size)
            .map(|(k, v)| ObjectInfo {
                key: k.clone(),
                size: v.data.len() as u64,
            })
            .collect();
        let more = matching.next().is_some();

        Ok(ListPage {
            next_token: if more {
                page.last().map(|o| o.key.clone())
            } else {
                None
            },
            objects: page,
        })
    }

    async fn put_file(&self, key: &str, path: &Path, options: &PutOptions) -> StorageResult<u64> {
        self.put_attempts.fetch_add(1, Ordering::SeqCst);
        if self.injected_failure(key) {
            return Err(StorageError::upload_failed(format!(
                "injected failure for {}",
                key
            )));
        }

        let data = tokio::fs::read(path).await?;
        let size = data.len() as u64;
        Self::lock(&self.objects).insert(
            key.to_string(),
            StoredObject {
                data,
                content_type: Some(options.content_type.clone()),
                cache_control: options.cache_control.clone(),
            },
        );
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(size)
    }

    async fn get_to_file(&self, key: &str, path: &Path) -> StorageResult<u64> {
        let data = self
            .get(key)
            .ok_or_else(|| StorageError::not_found(key))?
            .data;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let part = partial_path(path);
        tokio::fs::write(&part, &data).await?;
        tokio::fs::rename(&part, path).await?;
        Ok(data.len() as u64)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        Self::lock(&self.objects).remove(key);
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<Option<ObjectInfo>> {
        Ok(self.get(key).map(|o| ObjectInfo {
            key: key.to_string(),
            size: o.data.len() as u64,
        }))
    }
}
