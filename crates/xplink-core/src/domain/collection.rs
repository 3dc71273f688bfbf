//! Bounded, named sets of variables subscribed to the simulator as one unit.
//!
//! The streaming protocol can only carry a limited number of value
//! subscriptions per message, and the simulator's update bandwidth is finite;
//! a deck page, however, may reference far more variables than that. A
//! [`Collection`] is the scheduling unit that bridges the gap: the variables
//! one consumer needs, refreshed together, competing with other collections
//! for the single active subscription slot (see
//! [`crate::domain::scheduler`]).

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::domain::variable::Variable;

// ── Bounds and defaults ───────────────────────────────────────────────────────

/// Hard cap on members per collection — the practical per-message ceiling of
/// the streaming protocol. Larger collections are truncated at construction.
pub const MAX_COLLECTION_SIZE: usize = 40;

/// How long a completed refresh stays valid before the collection becomes a
/// candidate again.
pub const DEFAULT_COLLECTION_EXPIRE: Duration = Duration::from_secs(300);

/// How long a subscribed collection may go without any member update before
/// it is considered stalled.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10);

// ── State machine ─────────────────────────────────────────────────────────────

/// Lifecycle of a collection.
///
/// ```text
/// Idle ──selected──▶ Subscribed ──all members refreshed──▶ Idle
///  ▲                     │
///  │                     └──no update for stale window──▶ Stale
///  └──────────selected again (weighted draw)──────────────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionState {
    /// Not on the wire. Either freshly created, completed, or waiting its
    /// turn.
    Idle,
    /// Its members are the active subscription set.
    Subscribed,
    /// Was subscribed but produced no member updates for the stale window;
    /// unloaded and back in the candidate pool.
    Stale,
}

// ── Listener ──────────────────────────────────────────────────────────────────

/// Notified when a collection completes a full refresh.
///
/// Held weakly, like [`crate::domain::variable::VariableListener`]: dropping
/// the listener unregisters it.
pub trait CollectionListener: Send + Sync {
    fn collection_refreshed(&self, collection: &Collection);
}

// ── Collection ────────────────────────────────────────────────────────────────

/// A named group of variables refreshed together.
pub struct Collection {
    name: String,
    members: Vec<Arc<Variable>>,
    expire: Duration,
    stale_timeout: Duration,
    state: CollectionState,
    niceness: u32,
    last_subscribed_at: Option<Instant>,
    last_fully_refreshed_at: Option<Instant>,
    listeners: Vec<Weak<dyn CollectionListener>>,
}

impl fmt::Debug for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.name)
            .field("members", &self.members.len())
            .field("state", &self.state)
            .field("niceness", &self.niceness)
            .finish()
    }
}

impl Collection {
    /// Creates an idle collection with niceness 1.
    ///
    /// Member lists longer than [`MAX_COLLECTION_SIZE`] are truncated (kept
    /// members are the first `MAX_COLLECTION_SIZE` in the given order) and a
    /// warning is logged; the collection is never rejected.
    pub fn new(
        name: impl Into<String>,
        mut members: Vec<Arc<Variable>>,
        expire: Option<Duration>,
        stale_timeout: Option<Duration>,
    ) -> Collection {
        let name = name.into();
        if members.len() > MAX_COLLECTION_SIZE {
            warn!(
                "collection {name} has {} members; truncating to {MAX_COLLECTION_SIZE}",
                members.len()
            );
            members.truncate(MAX_COLLECTION_SIZE);
        }
        Collection {
            name,
            members,
            expire: expire.unwrap_or(DEFAULT_COLLECTION_EXPIRE),
            stale_timeout: stale_timeout.unwrap_or(DEFAULT_STALE_TIMEOUT),
            state: CollectionState::Idle,
            niceness: 1,
            last_subscribed_at: None,
            last_fully_refreshed_at: None,
            listeners: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CollectionState {
        self.state
    }

    pub fn niceness(&self) -> u32 {
        self.niceness
    }

    pub fn expire(&self) -> Duration {
        self.expire
    }

    pub fn members(&self) -> &[Arc<Variable>] {
        &self.members
    }

    pub fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn last_subscribed_at(&self) -> Option<Instant> {
        self.last_subscribed_at
    }

    pub fn last_fully_refreshed_at(&self) -> Option<Instant> {
        self.last_fully_refreshed_at
    }

    /// True when every member has been updated since the last subscribe.
    ///
    /// Never true before the first subscribe. An empty collection is
    /// trivially refreshed as soon as it is subscribed.
    pub fn is_fully_refreshed(&self) -> bool {
        let Some(since) = self.last_subscribed_at else {
            return false;
        };
        self.members
            .iter()
            .all(|m| m.last_updated().is_some_and(|at| at >= since))
    }

    /// True when the collection is subscribed but no member has updated for
    /// the stale window.
    pub fn is_stale(&self, now: Instant) -> bool {
        if self.state != CollectionState::Subscribed {
            return false;
        }
        let Some(since) = self.last_subscribed_at else {
            return false;
        };
        let newest = self
            .members
            .iter()
            .filter_map(|m| m.last_updated())
            .filter(|at| *at >= since)
            .max()
            .unwrap_or(since);
        now.duration_since(newest) >= self.stale_timeout
    }

    /// True when this collection should compete for the subscription slot:
    /// it is not currently subscribed, and it has either never completed a
    /// refresh or its last one has expired.
    pub fn needs_collecting(&self, now: Instant) -> bool {
        if self.state == CollectionState::Subscribed {
            return false;
        }
        match self.last_fully_refreshed_at {
            None => true,
            Some(at) => now.duration_since(at) >= self.expire,
        }
    }

    /// Registers a completion listener (idempotent).
    pub fn add_listener(&mut self, listener: &Arc<dyn CollectionListener>) {
        let already = self
            .listeners
            .iter()
            .any(|w| w.upgrade().is_some_and(|l| Arc::ptr_eq(&l, listener)));
        if already {
            debug!("listener already registered on collection {}", self.name);
            return;
        }
        self.listeners.push(Arc::downgrade(listener));
    }

    /// Unregisters a completion listener; absent listeners are a logged
    /// no-op.
    pub fn remove_listener(&mut self, listener: &Arc<dyn CollectionListener>) {
        let before = self.listeners.len();
        self.listeners.retain(|w| match w.upgrade() {
            Some(live) => !Arc::ptr_eq(&live, listener),
            None => false,
        });
        if self.listeners.len() == before {
            debug!("listener was not registered on collection {}", self.name);
        }
    }

    pub(crate) fn mark_subscribed(&mut self, now: Instant) {
        self.state = CollectionState::Subscribed;
        self.last_subscribed_at = Some(now);
    }

    pub(crate) fn mark_stale(&mut self) {
        self.state = CollectionState::Stale;
    }

    pub(crate) fn mark_idle(&mut self) {
        self.state = CollectionState::Idle;
    }

    /// Forgets the refresh history so the collection must be collected again
    /// from scratch. Used when the simulator session restarts and every
    /// mirrored value is suspect.
    pub(crate) fn invalidate(&mut self) {
        if self.state == CollectionState::Subscribed {
            self.state = CollectionState::Idle;
        }
        self.last_fully_refreshed_at = None;
    }

    pub(crate) fn mark_completed(&mut self, now: Instant) {
        self.state = CollectionState::Idle;
        self.last_fully_refreshed_at = Some(now);
        self.niceness = 1;
    }

    pub(crate) fn bump_niceness(&mut self) {
        self.niceness = self.niceness.saturating_add(1);
    }

    pub(crate) fn notify_refreshed(&mut self) {
        self.listeners.retain(|w| w.strong_count() > 0);
        let live: Vec<Arc<dyn CollectionListener>> =
            self.listeners.iter().filter_map(Weak::upgrade).collect();
        for listener in live {
            listener.collection_refreshed(self);
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
