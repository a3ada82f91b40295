//! Tracks which users already had a profile fetch since the last sign-out.
//!
//! Only "attempted" markers are stored, never profile content. An entry is
//! `InFlight` from the moment a fetch is issued until it resolves, then
//! `Complete` whether the fetch succeeded or failed terminally.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

/// Cache state for one user id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchState {
    InFlight,
    Complete,
}

/// Thread-safe set of user ids with a fetch in flight or completed
#[derive(Debug, Default)]
pub struct ProfileFetchCache {
    entries: DashMap<String, FetchState>,
}

impl ProfileFetchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a fetch should be issued for `user_id`.
    pub fn should_fetch(&self, user_id: &str, forced: bool) -> bool {
        forced || !self.entries.contains_key(user_id)
    }

    /// Check and mark `InFlight` in one step.
    ///
    /// Returns `true` if the caller now owns a fetch for `user_id`. Unforced
    /// requests lose against any existing entry, in flight or complete.
    pub fn try_begin(&self, user_id: &str, forced: bool) -> bool {
        match self.entries.entry(user_id.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(FetchState::InFlight);
                true
            }
            Entry::Occupied(mut slot) => {
                if forced {
                    slot.insert(FetchState::InFlight);
                }
                forced
            }
        }
    }

    pub fn mark_complete(&self, user_id: &str) {
        self.entries.insert(user_id.to_string(), FetchState::Complete);
    }

    pub fn state(&self, user_id: &str) -> Option<FetchState> {
        self.entries.get(user_id).map(|entry| *entry)
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
