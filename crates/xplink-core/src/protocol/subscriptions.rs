//! Subscription bookkeeping for the streaming connection.
//!
//! The wire protocol subscribes by remote id, with an optional index list
//! for array elements, and pushes array updates as a dense value list in
//! subscribed index order. This module keeps the local side of that
//! contract: per-id refcounts so that shared paths only leave the wire
//! when the last user releases them, the sorted de-duplicated index set
//! each id is subscribed with, and the previous generation of that set so
//! an update raced by a subscription change can still be decoded.

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;
use tracing::warn;

use crate::protocol::messages::DatarefSubscription;

// ── Path helpers ──────────────────────────────────────────────────────────────

/// Splits an array-element path `sim/some/values[4]` into
/// `("sim/some/values", Some(4))`. Paths without a well-formed trailing
/// index come back whole.
pub fn split_indexed_path(path: &str) -> (&str, Option<usize>) {
    if let Some(open) = path.find('[') {
        if path.ends_with(']') {
            let inner = &path[open + 1..path.len() - 1];
            if let Ok(index) = inner.parse::<usize>() {
                return (&path[..open], Some(index));
            }
        }
    }
    (path, None)
}

// ── Index sets ────────────────────────────────────────────────────────────────

/// Error raised when an inbound dense array fits neither index generation.
#[derive(Debug, Error, PartialEq, Eq)]
#[error(
    "inbound array of {got} values matches neither the current ({current}) \
     nor the previous ({previous}) subscribed index count"
)]
pub struct IndexMismatch {
    pub got: usize,
    pub current: usize,
    pub previous: usize,
}

/// The sorted, de-duplicated array indices one remote id is subscribed
/// with, plus the previous generation of the same set.
///
/// The simulator keeps streaming arrays shaped for the index set it knew
/// when it built the frame, so right after a subscription change an
/// inbound array may still match the older set. [`IndexSet::align`]
/// resolves which generation a frame belongs to by length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexSet {
    current: Vec<usize>,
    previous: Option<Vec<usize>>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saves the current generation before a batch of inserts/removes.
    pub fn snapshot(&mut self) {
        self.previous = Some(self.current.clone());
    }

    /// Adds an index, keeping the set sorted. Returns `false` if it was
    /// already present.
    pub fn insert(&mut self, index: usize) -> bool {
        match self.current.binary_search(&index) {
            Ok(_) => false,
            Err(pos) => {
                self.current.insert(pos, index);
                true
            }
        }
    }

    /// Removes an index. Returns `false` if it was not present.
    pub fn remove(&mut self, index: usize) -> bool {
        match self.current.binary_search(&index) {
            Ok(pos) => {
                self.current.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn current(&self) -> &[usize] {
        &self.current
    }

    pub fn previous(&self) -> Option<&[usize]> {
        self.previous.as_deref()
    }

    pub fn len(&self) -> usize {
        self.current.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty()
    }

    /// Picks the index generation a dense array of `len` values was built
    /// for: the current set first, the previous one as a fallback.
    ///
    /// # Errors
    ///
    /// Returns [`IndexMismatch`] when neither generation has `len`
    /// entries; the caller drops that single update.
    pub fn align(&self, len: usize) -> Result<&[usize], IndexMismatch> {
        if self.current.len() == len {
            return Ok(&self.current);
        }
        if let Some(previous) = self.previous.as_deref() {
            if previous.len() == len {
                warn!(
                    len,
                    current = self.current.len(),
                    "array update matches only the previous index generation"
                );
                return Ok(previous);
            }
        }
        Err(IndexMismatch {
            got: len,
            current: self.current.len(),
            previous: self.previous.as_ref().map_or(0, Vec::len),
        })
    }
}

// ── Ledger ────────────────────────────────────────────────────────────────────

/// What one remote id currently has on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coverage<'a> {
    /// The whole value streams (scalar, text, or full array).
    Whole,
    /// Only the listed array elements stream, in this order.
    Elements(&'a [usize]),
}

#[derive(Debug, Default)]
struct IdState {
    /// How many users subscribed the whole value.
    whole: usize,
    /// Refcount per subscribed array element.
    elements: BTreeMap<usize, usize>,
    /// Wire index set covering the element subscriptions.
    indices: IndexSet,
}

/// Refcounted record of everything subscribed on the streaming
/// connection, and the factory for the wire entries that change it.
///
/// `subscribe`/`unsubscribe` return only what must actually go on or off
/// the wire: a reference that was already covered (or is still held by
/// someone else) produces no entry.
#[derive(Debug, Default)]
pub struct SubscriptionLedger {
    ids: HashMap<u64, IdState>,
}

impl SubscriptionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records subscriptions for a group of `(id, optional element index)`
    /// references and returns the coalesced wire entries for the ones not
    /// already streaming. Element indices of the same id collapse into a
    /// single entry with a sorted index list.
    pub fn subscribe(&mut self, entries: &[(u64, Option<usize>)]) -> Vec<DatarefSubscription> {
        let mut wire: Vec<DatarefSubscription> = Vec::new();
        let mut element_slot: HashMap<u64, usize> = HashMap::new();
        let mut snapshotted: Vec<u64> = Vec::new();

        for &(id, index) in entries {
            let state = self.ids.entry(id).or_default();
            match index {
                None => {
                    state.whole += 1;
                    if state.whole == 1 {
                        wire.push(DatarefSubscription::whole(id));
                    }
                }
                Some(idx) => {
                    let count = state.elements.entry(idx).or_insert(0);
                    *count += 1;
                    if *count > 1 {
                        continue;
                    }
                    if !snapshotted.contains(&id) {
                        state.indices.snapshot();
                        snapshotted.push(id);
                    }
                    state.indices.insert(idx);
                    match element_slot.get(&id) {
                        Some(&slot) => {
                            if let Some(list) = wire[slot].index.as_mut() {
                                list.push(idx);
                            }
                        }
                        None => {
                            element_slot.insert(id, wire.len());
                            wire.push(DatarefSubscription::elements(id, vec![idx]));
                        }
                    }
                }
            }
        }

        for entry in &mut wire {
            if let Some(list) = entry.index.as_mut() {
                list.sort_unstable();
            }
        }
        wire
    }

    /// Records releases for a group of references and returns the wire
    /// entries for the ones whose last user just left. Ids with nothing
    /// left on the wire are forgotten entirely, so a late update for them
    /// is treated as unknown.
    pub fn unsubscribe(&mut self, entries: &[(u64, Option<usize>)]) -> Vec<DatarefSubscription> {
        let mut wire: Vec<DatarefSubscription> = Vec::new();
        let mut element_slot: HashMap<u64, usize> = HashMap::new();
        let mut snapshotted: Vec<u64> = Vec::new();

        for &(id, index) in entries {
            let Some(state) = self.ids.get_mut(&id) else {
                warn!(id, "release for an id that was never subscribed");
                continue;
            };
            match index {
                None => {
                    if state.whole == 0 {
                        warn!(id, "release of a whole-value subscription that is not held");
                        continue;
                    }
                    state.whole -= 1;
                    if state.whole == 0 {
                        wire.push(DatarefSubscription::whole(id));
                    }
                }
                Some(idx) => {
                    let Some(count) = state.elements.get_mut(&idx) else {
                        warn!(id, index = idx, "release of an element that is not held");
                        continue;
                    };
                    *count -= 1;
                    if *count > 0 {
                        continue;
                    }
                    state.elements.remove(&idx);
                    if !snapshotted.contains(&id) {
                        state.indices.snapshot();
                        snapshotted.push(id);
                    }
                    state.indices.remove(idx);
                    match element_slot.get(&id) {
                        Some(&slot) => {
                            if let Some(list) = wire[slot].index.as_mut() {
                                list.push(idx);
                            }
                        }
                        None => {
                            element_slot.insert(id, wire.len());
                            wire.push(DatarefSubscription::elements(id, vec![idx]));
                        }
                    }
                }
            }
        }

        self.ids
            .retain(|_, state| state.whole > 0 || !state.elements.is_empty());
        for entry in &mut wire {
            if let Some(list) = entry.index.as_mut() {
                list.sort_unstable();
            }
        }
        wire
    }

    /// What `id` currently has on the wire, if anything. Whole-value
    /// coverage wins when both kinds are held.
    pub fn coverage(&self, id: u64) -> Option<Coverage<'_>> {
        let state = self.ids.get(&id)?;
        if state.whole > 0 {
            Some(Coverage::Whole)
        } else if !state.elements.is_empty() {
            Some(Coverage::Elements(state.indices.current()))
        } else {
            None
        }
    }

    /// Resolves the index generation for an inbound dense array of `len`
    /// values for `id`.
    ///
    /// # Errors
    ///
    /// Returns [`IndexMismatch`] for unknown ids or when neither index
    /// generation fits.
    pub fn align(&self, id: u64, len: usize) -> Result<&[usize], IndexMismatch> {
        match self.ids.get(&id) {
            Some(state) => state.indices.align(len),
            None => Err(IndexMismatch {
                got: len,
                current: 0,
                previous: 0,
            }),
        }
    }

    /// Number of remote ids with anything on the wire.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Forgets everything, e.g. after a reconnect made the server-side
    /// subscriptions vanish.
    pub fn clear(&mut self) {
        self.ids.clear();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
