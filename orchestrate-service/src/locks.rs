use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockMap = Arc<Mutex<HashMap<String, Arc<RwLock<()>>>>>;

/// Async mutual exclusion keyed by resource name.
///
/// `lock` is exclusive; `lock_shared` admits any number of shared holders and excludes
/// `lock`. Entries are created on first use and removed when the last holder or waiter
/// goes away.
#[derive(Clone, Default)]
pub struct KeyedLocks {
    inner: LockMap,
}

#[derive(Debug)]
enum Held {
    Exclusive(OwnedRwLockWriteGuard<()>),
    Shared(OwnedRwLockReadGuard<()>),
}

#[derive(Debug)]
pub struct KeyGuard {
    key: String,
    held: Option<Held>,
    locks: LockMap,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, key: &str) -> Arc<RwLock<()>> {
        let mut map = self.inner.lock();
        map.entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    fn guard(&self, key: &str, held: Held) -> KeyGuard {
        KeyGuard {
            key: key.to_string(),
            held: Some(held),
            locks: self.inner.clone(),
        }
    }

    pub async fn lock(&self, key: &str) -> KeyGuard {
        let held = Held::Exclusive(self.entry(key).write_owned().await);
        self.guard(key, held)
    }

    pub async fn lock_shared(&self, key: &str) -> KeyGuard {
        let held = Held::Shared(self.entry(key).read_owned().await);
        self.guard(key, held)
    }

    /// Exclusive locks on every key, taken in sorted order so overlapping sets cannot
    /// deadlock. Duplicates are locked once.
    pub async fn lock_all(&self, keys: &[String]) -> Vec<KeyGuard> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            guards.push(self.lock(key).await);
        }
        guards
    }

    /// Number of keys currently tracked (held or awaited).
    pub fn tracked(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Drop for KeyGuard {
    fn drop(&mut self) {
        // Release first so the strong count below only counts the map and waiters.
        drop(self.held.take());
        let mut map = self.locks.lock();
        if let Some(entry) = map.get(&self.key) {
            if Arc::strong_count(entry) == 1 {
                map.remove(&self.key);
            }
        }
    }
}

/// Lock key for a record scoped to a zone, such as a Template.
pub fn resource_key(kind: &str, project: &str, zone: &str, name: &str) -> String {
    format!("{}:{}/{}/{}", kind, project, zone, name)
}

/// Lock key for a provider resource whose name is unique across the project.
pub fn provider_resource_key(kind: &str, project: &str, name: &str) -> String {
    format!("{}:{}/{}", kind, project, name)
}

pub fn project_key(project: &str) -> String {
    format!("project:{}", project)
}
