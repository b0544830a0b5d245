//! Bounded least-recently-used pool of open repository handles.
//!
//! Eviction drops the pool's strong reference only. A handle still held
//! elsewhere (an upload in flight, say) is revived by the next `get`, so two
//! live handles never exist for one repository. Otherwise `get` rebuilds the
//! handle from disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use super::{BackendKind, Repository, RepositoryError, RepositoryId};

/// Pool shared between connections; every operation runs under the lock.
pub type SharedPool = Arc<tokio::sync::Mutex<RepositoryPool>>;

/// Default number of resident repository handles.
pub const DEFAULT_POOL_CAPACITY: usize = 64;

struct PoolEntry {
    repository: Arc<Repository>,
    last_access: u64,
}

pub struct RepositoryPool {
    root: PathBuf,
    kind: BackendKind,
    capacity: usize,
    entries: HashMap<RepositoryId, PoolEntry>,
    /// Evicted handles that may still be in use outside the pool.
    evicted: HashMap<RepositoryId, Weak<Repository>>,
    clock: u64,
}

impl RepositoryPool {
    /// `kind` is used for repositories created through this pool. Capacity is at least one.
    pub fn new(root: impl Into<PathBuf>, kind: BackendKind, capacity: usize) -> Self {
        Self {
            root: root.into(),
            kind,
            capacity: capacity.max(1),
            entries: HashMap::new(),
            evicted: HashMap::new(),
            clock: 0,
        }
    }

    pub fn shared(self) -> SharedPool {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of handles currently held in memory.
    pub fn resident(&self) -> usize {
        self.entries.len()
    }

    pub fn is_resident(&self, id: &RepositoryId) -> bool {
        self.entries.contains_key(id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Handle for `id`, reconstructed from disk if it was evicted.
    /// `None` if no such repository exists; nothing is created implicitly.
    pub async fn get(&mut self, id: &RepositoryId) -> Result<Option<Arc<Repository>>, RepositoryError> {
        let now = self.tick();
        if let Some(entry) = self.entries.get_mut(id) {
            entry.last_access = now;
            return Ok(Some(entry.repository.clone()));
        }
        if let Some(live) = self.evicted.remove(id).and_then(|weak| weak.upgrade()) {
            tracing::debug!(repository = %id, "revived evicted repository handle");
            self.insert_arc(live.clone(), now);
            return Ok(Some(live));
        }
        let Some(repository) = Repository::open_existing(&self.root, id, self.kind).await? else {
            return Ok(None);
        };
        tracing::debug!(repository = %id, "reconstructed repository handle");
        Ok(Some(self.insert(repository, now)))
    }

    /// Allocate a fresh identifier and backing store.
    pub async fn create(&mut self) -> Result<(RepositoryId, Arc<Repository>), RepositoryError> {
        let id = RepositoryId::generate();
        let repository = Repository::create(&self.root, id.clone(), self.kind).await?;
        let now = self.tick();
        Ok((id, self.insert(repository, now)))
    }

    fn insert(&mut self, repository: Repository, now: u64) -> Arc<Repository> {
        let repository = Arc::new(repository);
        self.insert_arc(repository.clone(), now);
        repository
    }

    fn insert_arc(&mut self, repository: Arc<Repository>, now: u64) {
        self.entries.insert(
            repository.id().clone(),
            PoolEntry {
                repository,
                last_access: now,
            },
        );
        self.evict();
    }

    fn evict(&mut self) {
        while self.entries.len() > self.capacity {
            let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_access)
                .map(|(id, _)| id.clone())
            else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.evicted
                    .insert(oldest.clone(), Arc::downgrade(&entry.repository));
            }
            tracing::debug!(repository = %oldest, "evicted repository handle");
        }
        self.evicted.retain(|_, weak| weak.strong_count() > 0);
    }
}
