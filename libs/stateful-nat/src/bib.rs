//! The Binding Information Base.
//!
//! One table per transport protocol maps IPv6 transport addresses to the
//! IPv4 transport addresses the translator masquerades them behind. Entries
//! are indexed from both sides by ordered trees so the control channel can
//! paginate them, and are reference-counted by the sessions that use them:
//! a dynamic entry dies with its last session, a static entry never does.

use rustc_hash::FxHashMap;
use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::tuple::{Transport4, Transport6};

/// Opaque handle to a BIB entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BibId(u64);

/// A single IPv6↔IPv4 transport-address binding
#[derive(Debug, Clone)]
pub struct BibEntry {
    pub addr6: Transport6,
    pub addr4: Transport4,
    pub is_static: bool,
    sessions: usize,
}

impl BibEntry {
    /// Number of sessions currently referencing this binding
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions
    }
}

/// A per-protocol BIB table
#[derive(Debug, Default)]
pub struct Bib {
    entries: FxHashMap<u64, BibEntry>,
    by6: BTreeMap<Transport6, u64>,
    by4: BTreeMap<Transport4, u64>,
    next_id: u64,
}

impl Bib {
    /// Construct a new empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the binding for an IPv6 transport address
    #[must_use]
    pub fn get_by_6(&self, addr6: Transport6) -> Option<(BibId, &BibEntry)> {
        let id = *self.by6.get(&addr6)?;
        Some((BibId(id), &self.entries[&id]))
    }

    /// Look up the binding that owns an IPv4 transport address
    #[must_use]
    pub fn get_by_4(&self, addr4: Transport4) -> Option<(BibId, &BibEntry)> {
        let id = *self.by4.get(&addr4)?;
        Some((BibId(id), &self.entries[&id]))
    }

    /// Fetch an entry by handle
    #[must_use]
    pub fn get(&self, id: BibId) -> Option<&BibEntry> {
        self.entries.get(&id.0)
    }

    /// Insert a new binding, rejecting duplicates on either side
    pub fn add(&mut self, addr6: Transport6, addr4: Transport4, is_static: bool) -> Result<BibId> {
        if self.by6.contains_key(&addr6) || self.by4.contains_key(&addr4) {
            return Err(Error::DuplicateBib);
        }
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(
            id,
            BibEntry {
                addr6,
                addr4,
                is_static,
                sessions: 0,
            },
        );
        self.by6.insert(addr6, id);
        self.by4.insert(addr4, id);
        log::debug!("New binding {} <-> {}", addr6, addr4);
        Ok(BibId(id))
    }

    /// Remove an entry from both indices, returning it so the caller can
    /// release its port reservation
    pub fn remove(&mut self, id: BibId) -> Result<BibEntry> {
        let entry = self.entries.remove(&id.0).ok_or(Error::BibNotFound)?;
        self.by6.remove(&entry.addr6);
        self.by4.remove(&entry.addr4);
        log::debug!("Dropped binding {} <-> {}", entry.addr6, entry.addr4);
        Ok(entry)
    }

    /// Record that a session started using this binding
    pub fn inc_sessions(&mut self, id: BibId) {
        if let Some(entry) = self.entries.get_mut(&id.0) {
            entry.sessions += 1;
        }
    }

    /// Record that a session stopped using this binding.
    ///
    /// When the last session leaves a dynamic entry, the entry is removed
    /// and returned so its transport address can go back to the pool.
    pub fn dec_sessions(&mut self, id: BibId) -> Option<BibEntry> {
        let entry = self.entries.get_mut(&id.0)?;
        entry.sessions = entry.sessions.saturating_sub(1);
        if entry.sessions == 0 && !entry.is_static {
            return self.remove(id).ok();
        }
        None
    }

    /// Iterate entries ordered by their IPv4 transport address, starting
    /// after `cursor` when one is given
    pub fn iter_from(
        &self,
        cursor: Option<Transport4>,
    ) -> impl Iterator<Item = (BibId, &BibEntry)> {
        let start = match cursor {
            Some(addr4) => std::ops::Bound::Excluded(addr4),
            None => std::ops::Bound::Unbounded,
        };
        self.by4
            .range((start, std::ops::Bound::Unbounded))
            .map(|(_, id)| (BibId(*id), &self.entries[id]))
    }

    /// Get the number of bindings in the table
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
