//! Commit epochs and the registry of pinned readers.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::warn;

use ragdb_core::error::Result;
use ragdb_core::types::Version;

#[derive(Debug, Default)]
pub struct EpochClock {
    committed: AtomicU64,
    /// Pinned epoch -> number of readers holding it.
    readers: Mutex<BTreeMap<Version, usize>>,
}

impl EpochClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn committed(&self) -> Version {
        self.committed.load(Ordering::Acquire)
    }

    /// Version the next write batch is built under.
    pub fn pending(&self) -> Version {
        self.committed() + 1
    }

    /// Make `version` visible to readers that pin from now on.
    pub fn publish(&self, version: Version) {
        self.committed.store(version, Ordering::Release);
    }

    /// Pin the committed epoch for the lifetime of the returned guard.
    pub fn pin(self: &Arc<Self>) -> Result<ReadPin> {
        let mut readers = self.lock_readers();
        let epoch = self.committed();
        *readers.entry(epoch).or_insert(0) += 1;
        Ok(ReadPin { clock: Arc::clone(self), epoch })
    }

    /// Oldest epoch any current or future reader can observe.
    pub fn horizon(&self) -> Result<Version> {
        let readers = self.lock_readers();
        let committed = self.committed();
        Ok(readers.keys().next().map_or(committed, |&oldest| oldest.min(committed)))
    }

    pub fn active_readers(&self) -> usize {
        self.lock_readers().values().sum()
    }

    /// Every update leaves the counts whole, so a poisoned registry is
    /// still accurate.
    fn lock_readers(&self) -> MutexGuard<'_, BTreeMap<Version, usize>> {
        self.readers.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            warn!("reader registry lock poisoned; recovering");
            poisoned.into_inner()
        })
    }

    fn release(&self, epoch: Version) {
        let mut readers = self.lock_readers();
        if let Some(count) = readers.get_mut(&epoch) {
            *count -= 1;
            if *count == 0 {
                readers.remove(&epoch);
            }
        }
    }
}

/// A reader's hold on one epoch. Compaction never reclaims anything still
/// visible at a pinned epoch.
#[derive(Debug)]
pub struct ReadPin {
    clock: Arc<EpochClock>,
    epoch: Version,
}

impl ReadPin {
    pub fn epoch(&self) -> Version {
        self.epoch
    }
}

impl Drop for ReadPin {
    fn drop(&mut self) {
        self.clock.release(self.epoch);
    }
}
