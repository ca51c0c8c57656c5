//! Process-wide layer dedup index.
//!
//! Maps layer digests to where the blob already lives at the target, and
//! guards at-most-once fetching: a worker must hold the digest's lease
//! while streaming it. Leases are RAII handles released on every exit
//! path, including panics.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ferry_core::error::{FerryError, Result};
use parking_lot::Mutex;
use rand::Rng;

/// Where a deduplicated blob lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupScope {
    /// At a remote registry; `known_path` is an absolute URL.
    Remote,
    /// On the local filesystem; `known_path` is a path.
    Local,
}

/// One dedup record: the blob identified by the key digest is present at
/// `known_path`, first deposited there on behalf of `image_ref`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    pub scope: DedupScope,
    pub known_path: String,
    /// Repository that first deposited the blob; used as the `from=`
    /// repository for cross-repo mounts.
    pub image_ref: String,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<String, DedupEntry>,
    leases: HashSet<String>,
}

/// Shared dedup index; all operations take the single lock.
#[derive(Default)]
pub struct DedupIndex {
    inner: Mutex<Inner>,
}

impl DedupIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a digest.
    pub fn probe(&self, digest: &str) -> Option<DedupEntry> {
        self.inner.lock().entries.get(digest).cloned()
    }

    /// Record a blob location. A prior lease is not required: entries can
    /// be discovered via cross-repo mounts or destination HEAD probes.
    pub fn insert(&self, digest: &str, entry: DedupEntry) {
        self.inner
            .lock()
            .entries
            .insert(digest.to_string(), entry);
    }

    /// Drop a digest's entry; called on fetch-failure rollback.
    pub fn forget(&self, digest: &str) {
        self.inner.lock().entries.remove(digest);
    }

    /// Number of known blobs.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    /// Take the fetch lease for a digest. Fails fast with `Conflict` when
    /// another worker holds it; callers retry with backoff.
    pub fn acquire(self: &Arc<Self>, digest: &str) -> Result<LayerLease> {
        let mut inner = self.inner.lock();
        if !inner.leases.insert(digest.to_string()) {
            return Err(FerryError::Conflict(format!(
                "Layer {} is being fetched by another worker",
                digest
            )));
        }
        Ok(LayerLease {
            index: Arc::clone(self),
            digest: digest.to_string(),
        })
    }

    /// Acquire with jittered backoff until the holder releases.
    pub async fn acquire_with_backoff(self: &Arc<Self>, digest: &str) -> Result<LayerLease> {
        let mut delay = Duration::from_millis(50);
        loop {
            match self.acquire(digest) {
                Ok(lease) => return Ok(lease),
                Err(FerryError::Conflict(_)) => {
                    let jitter = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 2);
                    tokio::time::sleep(delay + Duration::from_millis(jitter)).await;
                    delay = (delay * 2).min(Duration::from_secs(2));
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn release(&self, digest: &str) {
        self.inner.lock().leases.remove(digest);
    }
}

/// Exclusive fetch lease for one layer digest; released on drop.
pub struct LayerLease {
    index: Arc<DedupIndex>,
    digest: String,
}

impl LayerLease {
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl Drop for LayerLease {
    fn drop(&mut self) {
        self.index.release(&self.digest);
    }
}
