//! Observable variable cells and the registry that owns them.
//!
//! A [`Variable`] is the unit of state in XPLink: a named, typed value with
//! change detection and synchronous listener notification. Everything the
//! rest of the system does — formulas, collections, protocol routing — ends
//! up reading or writing these cells.
//!
//! # Change detection
//!
//! `updated_count` increments on *every* write; `changed_count` increments
//! only when the stored value actually differs from the previous one
//! (transitions to and from "no value" count as changes). Rounding, when
//! configured, is applied before the comparison so jitter below the rounding
//! precision never counts as a change.
//!
//! # Notification
//!
//! Listeners are held as weak references: a `Variable` never keeps a consumer
//! alive, and dead listeners are pruned on the next notification pass.
//! Notification is synchronous and reentrant — a listener may update another
//! variable (or, pathologically, the same one) from inside
//! `variable_changed`. A thread-local depth counter bounds such cascades at
//! [`MAX_NOTIFY_DEPTH`]; exceeding it abandons the remainder of that chain
//! with a warning rather than overflowing the stack.

use std::cell::Cell;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Instant;

use thiserror::Error;
use tracing::{debug, warn};

// ── Name prefixes and classification ──────────────────────────────────────────

/// Prefix marking a process-local variable that never reaches the simulator.
pub const INTERNAL_PREFIX: &str = "data:";

/// Prefix marking a value owned by the activation layer, fetched on demand
/// through a [`crate::formula::StateProvider`] and never stored here.
pub const STATE_PREFIX: &str = "state:";

/// Where a variable's value lives, derived from its name exactly once.
///
/// The prefixes are checked in declaration order; anything unprefixed is a
/// remote simulator variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VariableKind {
    /// Process-local (`data:` prefix). Readable and writable without any
    /// network round-trip.
    Internal,
    /// Owned by the activation layer (`state:` prefix). Never registered in
    /// the [`VariableRegistry`] and never forwarded to the simulator.
    State,
    /// Lives in the simulator; mirrored here through the streaming protocol.
    Remote,
}

impl VariableKind {
    /// Classifies a variable name by its prefix.
    ///
    /// # Examples
    ///
    /// ```
    /// use xplink_core::domain::variable::VariableKind;
    ///
    /// assert_eq!(VariableKind::of("data:page-brightness"), VariableKind::Internal);
    /// assert_eq!(VariableKind::of("state:button-pressed"), VariableKind::State);
    /// assert_eq!(VariableKind::of("sim/cockpit/radio/com1"), VariableKind::Remote);
    /// ```
    pub fn of(name: &str) -> VariableKind {
        if name.starts_with(INTERNAL_PREFIX) {
            VariableKind::Internal
        } else if name.starts_with(STATE_PREFIX) {
            VariableKind::State
        } else {
            VariableKind::Remote
        }
    }
}

// ── Values ────────────────────────────────────────────────────────────────────

/// Declared shape of a variable's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int,
    Float,
    Byte,
    Text,
    IntArray,
    FloatArray,
    ByteArray,
}

/// A typed value held by a [`Variable`].
///
/// Equality (used for change detection) is the derived structural equality;
/// two floats compare bitwise-equal after `-0.0` normalization.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Byte(u8),
    Text(String),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    ByteArray(Vec<u8>),
}

impl Value {
    /// The [`DataType`] this value inhabits.
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int(_) => DataType::Int,
            Value::Float(_) => DataType::Float,
            Value::Byte(_) => DataType::Byte,
            Value::Text(_) => DataType::Text,
            Value::IntArray(_) => DataType::IntArray,
            Value::FloatArray(_) => DataType::FloatArray,
            Value::ByteArray(_) => DataType::ByteArray,
        }
    }

    /// Numeric view of scalar values; `None` for text and arrays.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Byte(b) => Some(f64::from(*b)),
            _ => None,
        }
    }

    /// Returns the value with `-0.0` collapsed to `0.0`.
    ///
    /// The simulator emits `-0.0` for some gauges at rest; without this the
    /// sign flip would register as a change on every crossing.
    pub fn normalized(self) -> Value {
        match self {
            Value::Float(f) => Value::Float(normalize_float(f)),
            Value::FloatArray(values) => {
                Value::FloatArray(values.into_iter().map(normalize_float).collect())
            }
            other => other,
        }
    }

    /// Applies decimal rounding to float values; integers, bytes, and text
    /// pass through untouched.
    pub fn rounded(self, digits: i32) -> Value {
        match self {
            Value::Float(f) => Value::Float(round_to(f, digits)),
            Value::FloatArray(values) => {
                Value::FloatArray(values.into_iter().map(|v| round_to(v, digits)).collect())
            }
            other => other,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Byte(b) => write!(f, "{b}"),
            Value::Text(s) => f.write_str(s),
            Value::IntArray(values) => write_array(f, values),
            Value::FloatArray(values) => write_array(f, values),
            Value::ByteArray(values) => write_array(f, values),
        }
    }
}

fn write_array<T: fmt::Display>(f: &mut fmt::Formatter<'_>, values: &[T]) -> fmt::Result {
    f.write_str("[")?;
    for (i, v) in values.iter().enumerate() {
        if i > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{v}")?;
    }
    f.write_str("]")
}

fn normalize_float(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

/// Rounds `value` to `digits` decimal places (negative digits round to tens,
/// hundreds, ...).
pub(crate) fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

// ── Listeners ─────────────────────────────────────────────────────────────────

/// Implemented by anything that wants to hear about variable changes:
/// formulas, deck pages, the scheduler's completion bookkeeping.
///
/// Variables hold listeners weakly, so implementors control their own
/// lifetime; dropping the last `Arc` to a listener silently unregisters it.
pub trait VariableListener: Send + Sync {
    /// Called synchronously after `variable`'s value changed (and the change
    /// was cascaded). The new value is already visible through
    /// [`Variable::value`].
    fn variable_changed(&self, variable: &Variable);

    /// Short label used in registration/removal logs.
    fn listener_name(&self) -> &str {
        "listener"
    }
}

/// Upper bound on reentrant notification depth per thread.
///
/// A listener updating another variable from inside `variable_changed` is
/// legal and common (that is how formulas cascade); a cycle between variables
/// is not, and is cut here instead of overflowing the stack.
pub const MAX_NOTIFY_DEPTH: usize = 16;

thread_local! {
    static NOTIFY_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// RAII guard around one level of notification depth.
struct NotifyGuard;

impl NotifyGuard {
    fn enter(variable: &str) -> Option<NotifyGuard> {
        NOTIFY_DEPTH.with(|depth| {
            let current = depth.get();
            if current >= MAX_NOTIFY_DEPTH {
                warn!(
                    "notification chain on {variable} aborted at depth {current}; \
                     variables likely form a cycle"
                );
                None
            } else {
                depth.set(current + 1);
                Some(NotifyGuard)
            }
        })
    }
}

impl Drop for NotifyGuard {
    fn drop(&mut self) {
        NOTIFY_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

// ── Variable ──────────────────────────────────────────────────────────────────

/// Mutable interior of a [`Variable`], guarded by one short-lived lock.
#[derive(Debug, Default)]
struct VariableState {
    current: Option<Value>,
    previous: Option<Value>,
    updated_count: u64,
    changed_count: u64,
    last_updated: Option<Instant>,
    last_changed: Option<Instant>,
    rounding: Option<i32>,
    update_frequency: Option<f32>,
    writable: bool,
}

/// A named, typed, observable value cell.
///
/// All methods take `&self`; interior mutability keeps the critical sections
/// short and none of them are held across a listener callback.
pub struct Variable {
    name: String,
    kind: VariableKind,
    data_type: DataType,
    state: Mutex<VariableState>,
    listeners: Mutex<Vec<Weak<dyn VariableListener>>>,
}

impl fmt::Debug for Variable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Variable")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("data_type", &self.data_type)
            .field("value", &self.value())
            .finish()
    }
}

impl Variable {
    /// Creates a variable with no value. The kind is derived from the name
    /// prefix and fixed for the variable's lifetime.
    pub fn new(name: impl Into<String>, data_type: DataType) -> Variable {
        let name = name.into();
        let kind = VariableKind::of(&name);
        Variable {
            name,
            kind,
            data_type,
            state: Mutex::new(VariableState::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> VariableKind {
        self.kind
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn value(&self) -> Option<Value> {
        self.lock_state().current.clone()
    }

    pub fn previous_value(&self) -> Option<Value> {
        self.lock_state().previous.clone()
    }

    pub fn updated_count(&self) -> u64 {
        self.lock_state().updated_count
    }

    pub fn changed_count(&self) -> u64 {
        self.lock_state().changed_count
    }

    pub fn last_updated(&self) -> Option<Instant> {
        self.lock_state().last_updated
    }

    pub fn last_changed(&self) -> Option<Instant> {
        self.lock_state().last_changed
    }

    pub fn is_writable(&self) -> bool {
        self.lock_state().writable
    }

    pub fn set_writable(&self, writable: bool) {
        self.lock_state().writable = writable;
    }

    pub fn rounding(&self) -> Option<i32> {
        self.lock_state().rounding
    }

    /// Sets the decimal precision applied to float values before change
    /// detection. `None` disables rounding.
    pub fn set_rounding(&self, digits: Option<i32>) {
        self.lock_state().rounding = digits;
    }

    /// Desired refresh rate hint in updates per second, forwarded to the
    /// protocol layer when available. Purely advisory.
    pub fn update_frequency(&self) -> Option<f32> {
        self.lock_state().update_frequency
    }

    pub fn set_update_frequency(&self, hz: Option<f32>) {
        self.lock_state().update_frequency = hz;
    }

    /// Stores a new value and returns whether it differed from the previous
    /// one.
    ///
    /// Every call bumps `updated_count` and the last-updated timestamp.
    /// `-0.0` is normalized and rounding (if configured) applied *before* the
    /// change comparison, then `changed_count` is bumped only on an actual
    /// change. Listeners are notified iff the value changed **and** `cascade`
    /// is true.
    pub fn update_value(&self, new_value: Option<Value>, cascade: bool) -> bool {
        let changed = {
            let mut state = self.lock_state();
            let mut incoming = new_value.map(Value::normalized);
            if let Some(digits) = state.rounding {
                incoming = incoming.map(|v| v.rounded(digits));
            }
            state.previous = state.current.take();
            state.current = incoming;
            state.updated_count += 1;
            let now = Instant::now();
            state.last_updated = Some(now);
            let changed = state.current != state.previous;
            if changed {
                state.changed_count += 1;
                state.last_changed = Some(now);
            }
            changed
        };
        if changed && cascade {
            self.notify();
        }
        changed
    }

    /// Registers a listener. Re-adding the same listener is a no-op (logged
    /// at debug), so callers never need to track whether they already
    /// subscribed.
    pub fn add_listener(&self, listener: &Arc<dyn VariableListener>) {
        let mut listeners = self.lock_listeners();
        let already = listeners
            .iter()
            .any(|w| w.upgrade().is_some_and(|l| Arc::ptr_eq(&l, listener)));
        if already {
            debug!(
                "listener {} already registered on {}",
                listener.listener_name(),
                self.name
            );
            return;
        }
        listeners.push(Arc::downgrade(listener));
    }

    /// Unregisters a listener. Removing one that was never added is a no-op
    /// (logged at debug).
    pub fn remove_listener(&self, listener: &Arc<dyn VariableListener>) {
        let mut listeners = self.lock_listeners();
        let mut removed = false;
        listeners.retain(|w| match w.upgrade() {
            Some(live) => {
                if Arc::ptr_eq(&live, listener) {
                    removed = true;
                    false
                } else {
                    true
                }
            }
            // Prune dead entries while we are here.
            None => false,
        });
        if !removed {
            debug!(
                "listener {} was not registered on {}",
                listener.listener_name(),
                self.name
            );
        }
    }

    /// Number of live listeners currently registered.
    pub fn listener_count(&self) -> usize {
        self.lock_listeners()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Synchronously invokes every live listener.
    ///
    /// No lock is held while listeners run, so a listener may freely update
    /// other variables (or re-enter this one). Chains deeper than
    /// [`MAX_NOTIFY_DEPTH`] are cut with a warning.
    pub fn notify(&self) {
        let Some(_guard) = NotifyGuard::enter(&self.name) else {
            return;
        };
        let live: Vec<Arc<dyn VariableListener>> = {
            let mut listeners = self.lock_listeners();
            listeners.retain(|w| w.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in live {
            listener.variable_changed(self);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, VariableState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Vec<Weak<dyn VariableListener>>> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Errors from [`VariableRegistry`] operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// `state:` values live in the activation layer and are fetched through a
    /// provider; storing one here would shadow the real owner.
    #[error("state values are not stored in the registry: {0}")]
    StateName(String),
}

/// The process-wide map from name to [`Variable`].
///
/// This is an explicit context object: the client creates one per
/// synchronization session and passes it to whatever needs it. Nothing in
/// this crate holds a global.
#[derive(Default)]
pub struct VariableRegistry {
    variables: RwLock<HashMap<String, Arc<Variable>>>,
}

impl fmt::Debug for VariableRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl VariableRegistry {
    pub fn new() -> VariableRegistry {
        VariableRegistry::default()
    }

    /// Returns the variable registered under `name`, creating it when absent.
    ///
    /// When the variable already exists with a different declared type, the
    /// existing cell wins (logged at debug) — the first registration fixes
    /// the type.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::StateName`] for `state:`-prefixed names.
    pub fn get_or_create(
        &self,
        name: &str,
        data_type: DataType,
    ) -> Result<Arc<Variable>, RegistryError> {
        if VariableKind::of(name) == VariableKind::State {
            return Err(RegistryError::StateName(name.to_string()));
        }
        if let Some(existing) = self.get(name) {
            if existing.data_type() != data_type {
                debug!(
                    "variable {name} already registered as {:?}; ignoring {data_type:?}",
                    existing.data_type()
                );
            }
            return Ok(existing);
        }
        let mut variables = self
            .variables
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // A writer may have raced us between the read above and this lock.
        let entry = variables
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Variable::new(name, data_type)));
        Ok(entry.clone())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Variable>> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Current value of `name`, if the variable exists and has one.
    pub fn value_of(&self, name: &str) -> Option<Value> {
        self.get(name).and_then(|v| v.value())
    }

    pub fn len(&self) -> usize {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all registered names, unordered.
    pub fn names(&self) -> Vec<String> {
        self.variables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
