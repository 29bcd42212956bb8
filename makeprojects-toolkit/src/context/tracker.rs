//! Change tracking shared by the persistence-context backends
//!
//! Each backend stages entity changes with a backend-specific payload (a row
//! writer for the memory store, a JSON body for Postgres) and remembers the
//! row versions it has observed, which drive the optimistic concurrency checks.

use std::any::TypeId;
use std::collections::HashMap;

/// Tracked state of a staged entity change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Pending insert
    Added,
    /// Pending update
    Modified,
    /// Pending delete
    Deleted,
}

/// A staged change for one (entity type, key) pair
#[derive(Debug, Clone)]
pub(crate) struct StagedEntry<P> {
    pub type_id: TypeId,
    pub entity: &'static str,
    pub key: String,
    pub state: EntryState,
    /// New row content; `None` for deletes
    pub payload: Option<P>,
}

impl<P> StagedEntry<P> {
    fn same_row(&self, type_id: TypeId, key: &str) -> bool {
        self.type_id == type_id && self.key == key
    }
}

/// In-memory change tracker: staged entries plus observed row versions
#[derive(Debug)]
pub(crate) struct ChangeTracker<P> {
    versions: HashMap<(TypeId, String), u64>,
    staged: Vec<StagedEntry<P>>,
}

impl<P> Default for ChangeTracker<P> {
    fn default() -> Self {
        Self {
            versions: HashMap::new(),
            staged: Vec::new(),
        }
    }
}

impl<P> ChangeTracker<P> {
    /// Record the version a row was observed at
    pub fn remember(&mut self, type_id: TypeId, key: &str, version: u64) {
        self.versions.insert((type_id, key.to_string()), version);
    }

    /// Record the version a row was read at, unless the row is already tracked
    ///
    /// A repeated read does not refresh the original version; only a write or
    /// a reload does.
    pub fn observe(&mut self, type_id: TypeId, key: &str, version: u64) {
        self.versions
            .entry((type_id, key.to_string()))
            .or_insert(version);
    }

    /// Stop tracking a row
    pub fn forget(&mut self, type_id: TypeId, key: &str) {
        self.versions.remove(&(type_id, key.to_string()));
    }

    /// Version the row was last observed at, if tracked
    pub fn version(&self, type_id: TypeId, key: &str) -> Option<u64> {
        self.versions.get(&(type_id, key.to_string())).copied()
    }

    /// Copy of every tracked version, taken when a transaction begins
    pub fn versions_snapshot(&self) -> HashMap<(TypeId, String), u64> {
        self.versions.clone()
    }

    /// Put back the versions tracked before a transaction that did not commit
    pub fn restore_versions(&mut self, versions: HashMap<(TypeId, String), u64>) {
        self.versions = versions;
    }

    /// Stage a change, merging with an existing entry for the same row
    pub fn stage(&mut self, entry: StagedEntry<P>) {
        let Some(index) = self
            .staged
            .iter()
            .position(|e| e.same_row(entry.type_id, &entry.key))
        else {
            self.staged.push(entry);
            return;
        };

        let merged = match (self.staged[index].state, entry.state) {
            // An insert that is deleted before flushing never reaches the store
            (EntryState::Added, EntryState::Deleted) => {
                self.staged.remove(index);
                return;
            }
            (EntryState::Added, _) => EntryState::Added,
            (EntryState::Deleted, EntryState::Added) => EntryState::Modified,
            (_, state) => state,
        };

        let existing = &mut self.staged[index];
        existing.state = merged;
        existing.payload = entry.payload;
    }

    /// Remove and return all staged entries
    pub fn take_staged(&mut self) -> Vec<StagedEntry<P>> {
        std::mem::take(&mut self.staged)
    }

    /// Put entries back after a failed flush, ahead of anything staged since
    pub fn restore_staged(&mut self, entries: impl IntoIterator<Item = StagedEntry<P>>) {
        let newer = std::mem::take(&mut self.staged);
        self.staged = entries.into_iter().collect();
        for entry in newer {
            self.stage(entry);
        }
    }

    /// Drop the staged change for a row, if any
    pub fn discard(&mut self, type_id: TypeId, key: &str) {
        self.staged.retain(|e| !e.same_row(type_id, key));
    }

    /// Number of staged entries
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}
