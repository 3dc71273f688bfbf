//! Decides which single collection owns the streaming subscription slot.
//!
//! The scheduler is a pure state machine: it never touches a socket. The
//! connection layer calls [`CollectionScheduler::tick`] whenever the
//! simulator's clock variable updates (so cadence follows simulator time,
//! not host wall time) and applies the returned actions to the wire,
//! inserting [`PACING_DELAY`] after each subscribe/unsubscribe burst.
//!
//! # Selection policy
//!
//! When several collections need collecting, the winner is drawn at random
//! with probability proportional to niceness. Every passed-over candidate
//! has its niceness incremented, so a collection that keeps losing the draw
//! becomes ever more likely to win — statistically fair without the rigid
//! cadence of round-robin. Completing a refresh resets niceness to 1.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use rand::prelude::*;
use tracing::{debug, info, warn};

use crate::domain::collection::{Collection, CollectionListener, CollectionState};

/// Delay the connection layer inserts after applying each subscribe or
/// unsubscribe action, so bursts of collection churn cannot flood the
/// simulator.
pub const PACING_DELAY: Duration = Duration::from_millis(500);

// ── Actions ───────────────────────────────────────────────────────────────────

/// One wire-facing step produced by a tick, in application order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerAction {
    /// Remove these paths from the active subscription set.
    Unsubscribe {
        collection: String,
        paths: Vec<String>,
    },
    /// Add these paths to the active subscription set.
    Subscribe {
        collection: String,
        paths: Vec<String>,
    },
    /// The collection completed a full refresh (already notified to its
    /// listeners); purely informational for the connection layer's logs.
    Completed { collection: String },
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

/// Owns all registered collections and the one-active-collection invariant.
pub struct CollectionScheduler {
    collections: HashMap<String, Collection>,
    active: Option<String>,
    rng: StdRng,
}

impl fmt::Debug for CollectionScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionScheduler")
            .field("collections", &self.collections.len())
            .field("active", &self.active)
            .finish()
    }
}

impl Default for CollectionScheduler {
    fn default() -> Self {
        CollectionScheduler::new()
    }
}

impl CollectionScheduler {
    pub fn new() -> CollectionScheduler {
        CollectionScheduler {
            collections: HashMap::new(),
            active: None,
            rng: StdRng::from_entropy(),
        }
    }

    /// Deterministic scheduler for tests: the weighted draw replays
    /// identically for the same seed and collection set.
    pub fn with_seed(seed: u64) -> CollectionScheduler {
        CollectionScheduler {
            collections: HashMap::new(),
            active: None,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Registers (or replaces) a collection.
    ///
    /// Replacing the currently-subscribed collection unloads it first; the
    /// returned actions must be applied to the wire.
    pub fn add_collection(&mut self, collection: Collection) -> Vec<SchedulerAction> {
        let name = collection.name().to_string();
        let mut actions = Vec::new();
        if let Some(existing) = self.collections.get(&name) {
            debug!("replacing collection {name}");
            if self.active.as_deref() == Some(name.as_str()) {
                actions.push(SchedulerAction::Unsubscribe {
                    collection: name.clone(),
                    paths: existing.member_names(),
                });
                self.active = None;
            }
        }
        self.collections.insert(name, collection);
        actions
    }

    /// Unregisters a collection, unloading it first if it is the active one.
    pub fn remove_collection(&mut self, name: &str) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();
        match self.collections.remove(name) {
            Some(collection) => {
                if self.active.as_deref() == Some(name) {
                    actions.push(SchedulerAction::Unsubscribe {
                        collection: name.to_string(),
                        paths: collection.member_names(),
                    });
                    self.active = None;
                }
                debug!("removed collection {name}");
            }
            None => debug!("remove of unknown collection {name} ignored"),
        }
        actions
    }

    pub fn collection(&self, name: &str) -> Option<&Collection> {
        self.collections.get(name)
    }

    pub fn collection_names(&self) -> Vec<String> {
        self.collections.keys().cloned().collect()
    }

    /// Name of the currently-subscribed collection, if any.
    pub fn active(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    /// Registers a completion listener on `name`; returns false (logged) for
    /// an unknown collection.
    pub fn add_listener(&mut self, name: &str, listener: &std::sync::Arc<dyn CollectionListener>) -> bool {
        match self.collections.get_mut(name) {
            Some(collection) => {
                collection.add_listener(listener);
                true
            }
            None => {
                debug!("cannot listen on unknown collection {name}");
                false
            }
        }
    }

    pub fn remove_listener(
        &mut self,
        name: &str,
        listener: &std::sync::Arc<dyn CollectionListener>,
    ) -> bool {
        match self.collections.get_mut(name) {
            Some(collection) => {
                collection.remove_listener(listener);
                true
            }
            None => false,
        }
    }

    /// Clears the active slot after the streaming connection dropped.
    ///
    /// Refresh history is kept: values collected before the disconnect stay
    /// valid until their normal expiry.
    pub fn reset_connection(&mut self) {
        self.active = None;
        for collection in self.collections.values_mut() {
            if collection.state() == CollectionState::Subscribed {
                collection.mark_idle();
            }
        }
    }

    /// Clears the active slot *and* every collection's refresh history.
    /// Used when the simulator session restarted and all mirrored values are
    /// suspect.
    pub fn invalidate_all(&mut self) {
        self.active = None;
        for collection in self.collections.values_mut() {
            collection.invalidate();
        }
    }

    /// Re-evaluates the active collection and, when the slot is free, draws
    /// the next one. Returns the wire actions in application order.
    pub fn tick(&mut self, now: Instant) -> Vec<SchedulerAction> {
        let mut actions = Vec::new();

        if let Some(name) = self.active.clone() {
            match self.collections.get_mut(&name) {
                None => {
                    // Removed while active; remove_collection already emitted
                    // the unsubscribe.
                    self.active = None;
                }
                Some(collection) => {
                    if collection.is_fully_refreshed() {
                        info!("collection {name} fully refreshed");
                        actions.push(SchedulerAction::Unsubscribe {
                            collection: name.clone(),
                            paths: collection.member_names(),
                        });
                        collection.mark_completed(now);
                        collection.notify_refreshed();
                        actions.push(SchedulerAction::Completed {
                            collection: name.clone(),
                        });
                        self.active = None;
                    } else if collection.is_stale(now) {
                        warn!("collection {name} stalled with no member updates; unloading");
                        actions.push(SchedulerAction::Unsubscribe {
                            collection: name.clone(),
                            paths: collection.member_names(),
                        });
                        collection.mark_stale();
                        self.active = None;
                    }
                }
            }
        }

        if self.active.is_none() {
            if let Some(winner) = self.select_candidate(now) {
                if let Some(collection) = self.collections.get_mut(&winner) {
                    collection.mark_subscribed(now);
                    info!(
                        "collection {winner} subscribed ({} members)",
                        collection.members().len()
                    );
                    actions.push(SchedulerAction::Subscribe {
                        collection: winner.clone(),
                        paths: collection.member_names(),
                    });
                    self.active = Some(winner);
                }
            }
        }

        actions
    }

    /// Weighted random draw over every collection that needs collecting;
    /// the passed-over candidates each gain one niceness point.
    fn select_candidate(&mut self, now: Instant) -> Option<String> {
        let mut candidates: Vec<(String, u64)> = self
            .collections
            .values()
            .filter(|c| c.needs_collecting(now))
            .map(|c| (c.name().to_string(), u64::from(c.niceness())))
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Map iteration order is not stable; sort so seeded draws replay.
        candidates.sort();

        let total: u64 = candidates.iter().map(|(_, weight)| *weight).sum();
        let mut draw = self.rng.gen_range(0..total);
        let mut winner = None;
        for (name, weight) in &candidates {
            if draw < *weight {
                winner = Some(name.clone());
                break;
            }
            draw -= weight;
        }
        let winner = winner?;

        for (name, _) in &candidates {
            if *name != winner {
                if let Some(collection) = self.collections.get_mut(name) {
                    collection.bump_niceness();
                }
            }
        }
        Some(winner)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::variable::{DataType, Value, Variable};
    use std::sync::Arc;

    fn make_collection(name: &str, member_count: usize) -> (Collection, Vec<Arc<Variable>>) {
        let members: Vec<Arc<Variable>> = (0..member_count)
            .map(|i| {
                Arc::new(Variable::new(
                    format!("sim/test/{name}/m{i}"),
                    DataType::Float,
                ))
            })
            .collect();
        (
            Collection::new(name, members.clone(), None, None),
            members,
        )
    }

    fn refresh_all(members: &[Arc<Variable>]) {
        for m in members {
            m.update_value(Some(Value::Float(1.0)), false);
        }
    }

    fn subscribe_actions(actions: &[SchedulerAction]) -> Vec<&str> {
        actions
            .iter()
            .filter_map(|a| match a {
                SchedulerAction::Subscribe { collection, .. } => Some(collection.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_tick_subscribes_the_only_candidate() {
        let mut scheduler = CollectionScheduler::with_seed(7);
        let (col, _members) = make_collection("page-1", 2);
        assert!(scheduler.add_collection(col).is_empty());

        let actions = scheduler.tick(Instant::now());
        assert_eq!(
            subscribe_actions(&actions),
            vec!["page-1"],
            "the single needy collection wins the slot"
        );
        assert_eq!(scheduler.active(), Some("page-1"));
        assert_eq!(
            scheduler.collection("page-1").unwrap().state(),
            CollectionState::Subscribed
        );
    }

    #[test]
    fn test_at_most_one_collection_subscribed() {
        let mut scheduler = CollectionScheduler::with_seed(1);
        for name in ["a", "b", "c"] {
            let (col, _) = make_collection(name, 1);
            scheduler.add_collection(col);
        }

        let t0 = Instant::now();
        scheduler.tick(t0);
        // Active collection is neither complete nor stale: repeated ticks
        // must not load anything else.
        for i in 1..5 {
            let actions = scheduler.tick(t0 + Duration::from_secs(i));
            assert!(actions.is_empty(), "tick {i} emitted {actions:?}");
        }

        let subscribed: Vec<String> = scheduler
            .collection_names()
            .into_iter()
            .filter(|n| {
                scheduler.collection(n).unwrap().state() == CollectionState::Subscribed
            })
            .collect();
        assert_eq!(subscribed.len(), 1);
        assert_eq!(scheduler.active(), Some(subscribed[0].as_str()));
    }

    #[test]
    fn test_completion_unsubscribes_and_frees_the_slot() {
        let mut scheduler = CollectionScheduler::with_seed(3);
        let (col, members) = make_collection("page", 2);
        scheduler.add_collection(col);

        let t0 = Instant::now();
        scheduler.tick(t0);
        refresh_all(&members);

        let actions = scheduler.tick(t0 + Duration::from_millis(100));
        assert_eq!(
            actions,
            vec![
                SchedulerAction::Unsubscribe {
                    collection: "page".to_string(),
                    paths: vec![
                        "sim/test/page/m0".to_string(),
                        "sim/test/page/m1".to_string()
                    ],
                },
                SchedulerAction::Completed {
                    collection: "page".to_string()
                },
            ]
        );
        assert_eq!(scheduler.active(), None);
        let col = scheduler.collection("page").unwrap();
        assert_eq!(col.state(), CollectionState::Idle);
        assert_eq!(col.niceness(), 1);
        assert!(col.last_fully_refreshed_at().is_some());
    }

    #[test]
    fn test_completed_collection_not_reselected_before_expiry() {
        let mut scheduler = CollectionScheduler::with_seed(3);
        let (col, members) = make_collection("page", 1);
        scheduler.add_collection(col);

        let t0 = Instant::now();
        scheduler.tick(t0);
        refresh_all(&members);
        scheduler.tick(t0 + Duration::from_millis(100)); // completes

        let before = scheduler.tick(t0 + Duration::from_secs(299));
        assert!(before.is_empty(), "still within the expiry window");

        let after = scheduler.tick(t0 + Duration::from_secs(301));
        assert_eq!(subscribe_actions(&after), vec!["page"]);
    }

    #[test]
    fn test_stale_collection_unloaded_and_reselected_immediately() {
        let mut scheduler = CollectionScheduler::with_seed(3);
        let (col, _members) = make_collection("deaf", 1);
        scheduler.add_collection(col);

        let t0 = Instant::now();
        scheduler.tick(t0);

        // No member ever updates; after the 10s window the tick must unload
        // and immediately re-draw (here: the same collection, being alone).
        let actions = scheduler.tick(t0 + Duration::from_secs(11));
        assert!(matches!(
            actions[0],
            SchedulerAction::Unsubscribe { ref collection, .. } if collection == "deaf"
        ));
        assert_eq!(subscribe_actions(&actions), vec!["deaf"]);
        assert_eq!(scheduler.active(), Some("deaf"));
    }

    #[test]
    fn test_losers_accumulate_niceness() {
        let mut scheduler = CollectionScheduler::with_seed(42);
        let (a, _) = make_collection("a", 1);
        let (b, _) = make_collection("b", 1);
        scheduler.add_collection(a);
        scheduler.add_collection(b);

        scheduler.tick(Instant::now());

        let winner = scheduler.active().unwrap().to_string();
        let loser = if winner == "a" { "b" } else { "a" };
        assert_eq!(scheduler.collection(&winner).unwrap().niceness(), 1);
        assert_eq!(scheduler.collection(loser).unwrap().niceness(), 2);
    }

    #[test]
    fn test_weighted_draw_favors_higher_niceness_without_starvation() {
        // Fresh scheduler per draw keeps both niceness values constant.
        let mut a_wins = 0u32;
        let mut b_wins = 0u32;
        for seed in 0..1000 {
            let mut scheduler = CollectionScheduler::with_seed(seed);
            let (a, _) = make_collection("a", 1);
            let (mut b, _) = make_collection("b", 1);
            for _ in 0..4 {
                b.bump_niceness(); // niceness 5
            }
            scheduler.add_collection(a);
            scheduler.add_collection(b);
            scheduler.tick(Instant::now());
            match scheduler.active() {
                Some("a") => a_wins += 1,
                Some("b") => b_wins += 1,
                other => panic!("unexpected active collection {other:?}"),
            }
        }
        assert!(a_wins > 0, "niceness 1 must still win sometimes");
        assert!(
            b_wins > a_wins * 2,
            "niceness 5 should dominate: a={a_wins} b={b_wins}"
        );
    }

    #[test]
    fn test_replacing_active_collection_unloads_it() {
        let mut scheduler = CollectionScheduler::with_seed(9);
        let (col, _) = make_collection("page", 1);
        scheduler.add_collection(col);
        scheduler.tick(Instant::now());
        assert_eq!(scheduler.active(), Some("page"));

        let (replacement, _) = make_collection("page", 2);
        let actions = scheduler.add_collection(replacement);
        assert!(matches!(
            actions.as_slice(),
            [SchedulerAction::Unsubscribe { collection, .. }] if collection == "page"
        ));
        assert_eq!(scheduler.active(), None);
    }

    #[test]
    fn test_removing_active_collection_unloads_it() {
        let mut scheduler = CollectionScheduler::with_seed(9);
        let (col, _) = make_collection("page", 1);
        scheduler.add_collection(col);
        scheduler.tick(Instant::now());

        let actions = scheduler.remove_collection("page");
        assert_eq!(actions.len(), 1);
        assert_eq!(scheduler.active(), None);
        assert!(scheduler.is_empty());

        // Removing again is a quiet no-op.
        assert!(scheduler.remove_collection("page").is_empty());
    }

    #[test]
    fn test_reset_connection_keeps_refresh_history() {
        let mut scheduler = CollectionScheduler::with_seed(5);
        let (col, members) = make_collection("page", 1);
        scheduler.add_collection(col);
        let t0 = Instant::now();
        scheduler.tick(t0);
        refresh_all(&members);
        scheduler.tick(t0 + Duration::from_millis(100)); // completes
        scheduler.tick(t0 + Duration::from_millis(200));

        scheduler.reset_connection();
        assert_eq!(scheduler.active(), None);
        // Still refreshed: not a candidate until expiry.
        assert!(scheduler
            .tick(t0 + Duration::from_secs(100))
            .is_empty());
    }

    #[test]
    fn test_invalidate_all_forces_recollection() {
        let mut scheduler = CollectionScheduler::with_seed(5);
        let (col, members) = make_collection("page", 1);
        scheduler.add_collection(col);
        let t0 = Instant::now();
        scheduler.tick(t0);
        refresh_all(&members);
        scheduler.tick(t0 + Duration::from_millis(100)); // completes

        scheduler.invalidate_all();
        let actions = scheduler.tick(t0 + Duration::from_millis(200));
        assert_eq!(subscribe_actions(&actions), vec!["page"]);
    }

    #[test]
    fn test_listener_registration_through_scheduler() {
        use crate::domain::collection::CollectionListener;
        use std::sync::Mutex;

        struct Recorder(Mutex<u32>);
        impl CollectionListener for Recorder {
            fn collection_refreshed(&self, _collection: &Collection) {
                *self.0.lock().unwrap() += 1;
            }
        }

        let mut scheduler = CollectionScheduler::with_seed(5);
        let (col, members) = make_collection("page", 1);
        scheduler.add_collection(col);

        let recorder = Arc::new(Recorder(Mutex::new(0)));
        let as_listener: Arc<dyn CollectionListener> = recorder.clone();
        assert!(scheduler.add_listener("page", &as_listener));
        assert!(!scheduler.add_listener("missing", &as_listener));

        let t0 = Instant::now();
        scheduler.tick(t0);
        refresh_all(&members);
        scheduler.tick(t0 + Duration::from_millis(100));

        assert_eq!(*recorder.0.lock().unwrap(), 1);
    }
}
