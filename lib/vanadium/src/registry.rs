use crate::error::{DriverError, DriverResult};
use crate::vbucket::VBucket;
use ballast::crypto::crc32_short;
use ballast::logging;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Number of coordination slots gating first-time topology fetches.
pub const FETCH_LOCK_SLOTS: usize = 20;

/// How long a losing racer waits before reading the populated entry.
const FETCH_WAIT: Duration = Duration::from_millis(500);

lazy_static! {
    static ref GLOBAL: Arc<Registry> = Arc::new(Registry::new(None));
}

/// Process-wide registry: cluster name → bucket name → shared vbucket.
/// Entries are created lazily on first client creation and reused for the
/// process lifetime; refreshes happen in place on the shared `VBucket`.
///
/// First-time fetches are gated by a fingerprinted lock slot so two workers
/// racing on the same (cluster, bucket) produce exactly one config fetch;
/// the loser sleeps briefly and then reads the winner's entry.
pub struct Registry {
    clusters: Mutex<HashMap<String, HashMap<String, Arc<VBucket>>>>,
    fetch_locks: [AtomicBool; FETCH_LOCK_SLOTS],
    log: logging::Logger,
}

impl Registry {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(log: L) -> Registry {
        Registry {
            clusters: Mutex::new(HashMap::new()),
            fetch_locks: Default::default(),
            log: logging::child(log),
        }
    }

    /// The process-wide instance. Tests inject their own registry instead.
    pub fn global() -> Arc<Registry> {
        GLOBAL.clone()
    }

    pub fn get(&self, cluster: &str, bucket: &str) -> Option<Arc<VBucket>> {
        self.clusters
            .lock()
            .expect("Cluster registry lock poisoned")
            .get(cluster)
            .and_then(|buckets| buckets.get(bucket))
            .cloned()
    }

    /// Returns the vbucket for (cluster, bucket), creating it with `create`
    /// if absent. At most one concurrent caller runs `create`.
    pub fn get_or_create<F>(&self, cluster: &str, bucket: &str, create: F) -> DriverResult<Arc<VBucket>>
    where
        F: FnOnce() -> DriverResult<VBucket>,
    {
        if let Some(vbucket) = self.get(cluster, bucket) {
            return Ok(vbucket);
        }

        let slot = Self::slot(cluster, bucket);

        if self.fetch_locks[slot]
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            logging::debug!(self.log, "performing cold topology fetch";
                            "context" => "get_or_create",
                            "cluster" => cluster,
                            "bucket" => bucket,
                            "slot" => slot);

            let result = self.create_entry(cluster, bucket, create);
            self.fetch_locks[slot].store(false, Ordering::SeqCst);
            return result;
        }

        // Another worker holds the slot; wait for it to populate the entry.
        logging::debug!(self.log, "topology fetch in flight elsewhere, waiting";
                        "context" => "get_or_create",
                        "cluster" => cluster,
                        "bucket" => bucket,
                        "slot" => slot);

        thread::sleep(FETCH_WAIT);

        self.get(cluster, bucket).ok_or_else(|| {
            DriverError::ConfigFetch(format!(
                "concurrent topology fetch for `{}`/`{}` did not populate the registry",
                cluster, bucket
            ))
        })
    }

    fn create_entry<F>(&self, cluster: &str, bucket: &str, create: F) -> DriverResult<Arc<VBucket>>
    where
        F: FnOnce() -> DriverResult<VBucket>,
    {
        // The slot may have been won after another worker already finished.
        if let Some(vbucket) = self.get(cluster, bucket) {
            return Ok(vbucket);
        }

        let vbucket = Arc::new(create()?);

        self.clusters
            .lock()
            .expect("Cluster registry lock poisoned")
            .entry(cluster.to_string())
            .or_insert_with(HashMap::new)
            .insert(bucket.to_string(), vbucket.clone());

        Ok(vbucket)
    }

    /// Drops a bucket entry, forcing the next client to bootstrap anew.
    pub fn evict(&self, cluster: &str, bucket: &str) {
        if let Some(buckets) = self
            .clusters
            .lock()
            .expect("Cluster registry lock poisoned")
            .get_mut(cluster)
        {
            buckets.remove(bucket);
        }
    }

    #[inline]
    fn slot(cluster: &str, bucket: &str) -> usize {
        let fingerprint =
            crc32_short(cluster.as_bytes()).wrapping_add(crc32_short(bucket.as_bytes()));
        fingerprint as usize % FETCH_LOCK_SLOTS
    }
}
