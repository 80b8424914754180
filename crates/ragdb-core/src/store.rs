//! Versioned slot table shared by the dense and sparse indices.
//!
//! Entries are appended and never mutated in place apart from their
//! lifespan. Deletes set `deleted`, re-upserts tombstone the previous entry
//! and append a new one, and compaction rebuilds the table without the
//! entries that no reader can see any more.

use std::collections::HashMap;
use std::sync::Arc;

use crate::filter::Filter;
use crate::types::{Chunk, ChunkId, IndexEntry, IndexKind, Lifespan, Version};

#[derive(Debug, Clone)]
pub struct Slot<P> {
    pub chunk: Arc<Chunk>,
    pub life: Lifespan,
    pub payload: P,
}

/// Slots touched by an abort.
#[derive(Debug, Default)]
pub struct AbortOutcome {
    /// Entries created by the aborted version; now permanently invisible.
    pub killed: Vec<usize>,
    /// Entries whose tombstone from the aborted version was lifted.
    pub revived: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct EntryTable<P> {
    slots: Vec<Slot<P>>,
    by_id: HashMap<ChunkId, Vec<usize>>,
    tombstoned: usize,
}

impl<P> Default for EntryTable<P> {
    fn default() -> Self {
        Self { slots: Vec::new(), by_id: HashMap::new(), tombstoned: 0 }
    }
}

impl<P> EntryTable<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry created at `version`, tombstoning the current live
    /// entry for the same id. Returns the new slot and the replaced one.
    pub fn insert(&mut self, chunk: Arc<Chunk>, payload: P, version: Version) -> (usize, Option<usize>) {
        let replaced = self.delete(&chunk.id, version);
        let slot = self.slots.len();
        self.by_id.entry(chunk.id.clone()).or_default().push(slot);
        self.slots.push(Slot { chunk, life: Lifespan::new(version), payload });
        (slot, replaced)
    }

    /// Tombstone the live (not yet deleted) entry for `id`.
    pub fn delete(&mut self, id: &str, version: Version) -> Option<usize> {
        let slot = *self.by_id.get(id)?.iter().rev().find(|&&s| self.slots[s].life.deleted.is_none())?;
        self.slots[slot].life.deleted = Some(version);
        self.tombstoned += 1;
        Some(slot)
    }

    pub fn abort(&mut self, version: Version) -> AbortOutcome {
        let mut outcome = AbortOutcome::default();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.life.created == version {
                if slot.life.deleted.is_none() {
                    self.tombstoned += 1;
                }
                if slot.life.deleted != Some(version) {
                    outcome.killed.push(i);
                }
                slot.life.deleted = Some(version);
            } else if slot.life.deleted == Some(version) {
                slot.life.deleted = None;
                self.tombstoned -= 1;
                outcome.revived.push(i);
            }
        }
        outcome
    }

    pub fn slot(&self, slot: usize) -> Option<&Slot<P>> {
        self.slots.get(slot)
    }

    pub fn slots(&self) -> impl Iterator<Item = (usize, &Slot<P>)> {
        self.slots.iter().enumerate()
    }

    pub fn visible(&self, at: Version) -> impl Iterator<Item = (usize, &Slot<P>)> {
        self.slots().filter(move |(_, s)| s.life.visible_at(at))
    }

    pub fn physical(&self) -> usize {
        self.slots.len()
    }

    pub fn tombstoned(&self) -> usize {
        self.tombstoned
    }

    /// Entries not deleted by any version, published or not.
    pub fn current(&self) -> usize {
        self.slots.len() - self.tombstoned
    }

    pub fn live_at(&self, at: Version) -> usize {
        self.visible(at).count()
    }

    /// State of `id` as seen at `at`: the visible entry if there is one,
    /// otherwise the newest tombstone. Aborted entries never count.
    pub fn entry_state(&self, kind: IndexKind, id: &str, at: Version) -> Option<IndexEntry> {
        let slots = self.by_id.get(id)?;
        let slot = slots
            .iter()
            .map(|&s| &self.slots[s])
            .find(|s| s.life.visible_at(at))
            .or_else(|| {
                slots.iter().rev().map(|&s| &self.slots[s]).find(|s| s.life.created <= at && !s.life.is_aborted())
            })?;
        Some(IndexEntry {
            chunk_id: slot.chunk.id.clone(),
            index_kind: kind,
            version: slot.life.created,
            tombstoned: !slot.life.visible_at(at),
            metadata: slot.chunk.metadata.clone(),
        })
    }

    pub fn matching_ids(&self, filter: &Filter, at: Version) -> Vec<ChunkId> {
        let mut ids: Vec<ChunkId> =
            self.visible(at).filter(|(_, s)| filter.matches(&s.chunk)).map(|(_, s)| s.chunk.id.clone()).collect();
        ids.sort();
        ids
    }

    pub fn live_entries(&self, kind: IndexKind, at: Version) -> Vec<IndexEntry> {
        let mut entries: Vec<IndexEntry> = self
            .visible(at)
            .map(|(_, s)| IndexEntry {
                chunk_id: s.chunk.id.clone(),
                index_kind: kind,
                version: s.life.created,
                tombstoned: false,
                metadata: s.chunk.metadata.clone(),
            })
            .collect();
        entries.sort_by(|a, b| a.chunk_id.cmp(&b.chunk_id));
        entries
    }
}

impl<P: Clone> EntryTable<P> {
    /// Copy of the table without entries reclaimable at `horizon`. The
    /// returned vector maps old slot numbers to new ones.
    pub fn compacted(&self, horizon: Version) -> (Self, Vec<Option<usize>>) {
        let mut next = Self::new();
        let mut remap = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            if slot.life.reclaimable(horizon) {
                remap.push(None);
                continue;
            }
            let i = next.slots.len();
            next.by_id.entry(slot.chunk.id.clone()).or_default().push(i);
            if slot.life.is_tombstoned() {
                next.tombstoned += 1;
            }
            next.slots.push(slot.clone());
            remap.push(Some(i));
        }
        (next, remap)
    }
}
