//! The synchronization service: one supervisor task that discovers the
//! simulator, loads its catalogs, runs the streaming connection, and mirrors
//! remote values into the [`VariableRegistry`].
//!
//! The service splits into a planning half and an I/O half. Planning methods
//! (`plan_*`, `build_*`) take short locks, mutate bookkeeping, and return the
//! wire requests that must go out; the async half sends them and sleeps the
//! pacing delay where the scheduler asks for it. Replies are handled the same
//! way in reverse, which keeps every protocol decision testable without a
//! socket.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use xplink_core::domain::scheduler::PACING_DELAY;
use xplink_core::domain::variable::RegistryError;
use xplink_core::protocol::messages::DatarefWrite;
use xplink_core::protocol::{split_indexed_path, Coverage, SubscriptionLedger};
use xplink_core::{
    Catalog, Collection, CollectionListener, CollectionScheduler, DataType, DatarefMeta,
    RemoteValueType, RequestCounter, RequestLog, SchedulerAction, StreamReply, StreamRequest,
    Value, Variable, VariableKind, VariableRegistry,
};

use crate::infrastructure::network::beacon::{
    discover_simulator, DiscoveryError, SimulatorEndpoint,
};
use crate::infrastructure::network::rest_client::{RestClient, RestError};
use crate::infrastructure::network::ws_client::{
    self, Inbound, StreamError, StreamSender, WsSource, INITIAL_RECEIVE_TIMEOUT,
    STEADY_RECEIVE_TIMEOUT,
};
use crate::infrastructure::storage::config::AppConfig;

/// Internal variable that mirrors the connection stage (0..=4) so deck pages
/// can render link health.
pub const CONNECTION_STATUS_VARIABLE: &str = "data:connection-status";

/// Prefix of the internal variables that mirror command active states.
pub const COMMAND_ACTIVE_PREFIX: &str = "data:command-active:";

/// Simulator clock; every update drives one scheduler tick.
const CLOCK_DATAREF: &str = "sim/time/zulu_time_sec";

/// Simulator uptime; a decrease means the session restarted under us.
const UPTIME_DATAREF: &str = "sim/time/total_running_time_sec";

/// Always-subscribed datarefs, kept outside any collection.
const CORE_DATAREFS: [&str; 2] = [CLOCK_DATAREF, UPTIME_DATAREF];

/// Minimum wall-clock spacing between catalog reloads, so a burst of uptime
/// resets cannot hammer the REST API.
const CATALOG_RELOAD_GUARD: Duration = Duration::from_secs(10);

/// How long `stop` waits for the supervisor to wind down. Slightly more than
/// the steady receive timeout, which is the longest the receiver can sit
/// without observing the stop flag.
const STOP_GRACE: Duration = Duration::from_secs(6);

/// Slice length for interruptible reconnect sleeps.
const STOP_POLL: Duration = Duration::from_millis(200);

// ── Connection stage ──────────────────────────────────────────────────────────

/// How far the connection has progressed, published as
/// [`CONNECTION_STATUS_VARIABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionStage {
    Disconnected = 0,
    /// A beacon arrived (or a configured endpoint was taken on trust).
    BeaconReceived = 1,
    /// Dataref/command catalogs are loaded over REST.
    CatalogLoaded = 2,
    /// The streaming connection is up and the core subscription is out.
    Streaming = 3,
    /// At least one update has arrived on the streaming connection.
    Receiving = 4,
}

impl ConnectionStage {
    fn from_u8(raw: u8) -> ConnectionStage {
        match raw {
            1 => ConnectionStage::BeaconReceived,
            2 => ConnectionStage::CatalogLoaded,
            3 => ConnectionStage::Streaming,
            4 => ConnectionStage::Receiving,
            _ => ConnectionStage::Disconnected,
        }
    }

    fn as_status_value(self) -> Value {
        Value::Int(self as u8 as i64)
    }
}

// ── Session outcomes ──────────────────────────────────────────────────────────

/// One wire request produced by planning, with its pacing requirement.
/// Scheduler-driven loads and unloads pace; everything else sends
/// immediately.
#[derive(Debug)]
struct Outbound {
    request: StreamRequest,
    pace: bool,
}

/// Everything a handled reply asks the async side to do.
#[derive(Debug, Default)]
struct ReplyOutcome {
    outbound: Vec<Outbound>,
    catalog_reload: bool,
}

/// Why a streaming session ended without an error.
#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    /// The stop flag was observed; the supervisor exits.
    Stopped,
    /// The connection closed or went quiet; the supervisor retries.
    ConnectionLost,
}

/// Any failure on the way from discovery to a live streaming connection.
#[derive(Debug, Error)]
enum SessionError {
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Rest(#[from] RestError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

// ── Core state ────────────────────────────────────────────────────────────────

/// Shared state behind the service facade. Everything the supervisor, the
/// receiver, and user-facing calls touch lives here behind its own lock;
/// locks are taken one at a time and never held across an await.
struct SyncCore {
    config: AppConfig,
    registry: Arc<VariableRegistry>,
    catalog: RwLock<Catalog>,
    scheduler: Mutex<CollectionScheduler>,
    ledger: Mutex<SubscriptionLedger>,
    counter: RequestCounter,
    requests: RequestLog,
    /// Live streaming sender while a session is up.
    link: AsyncMutex<Option<StreamSender>>,
    /// REST client of the current session, kept for catalog reloads.
    rest: AsyncMutex<Option<RestClient>>,
    running: Arc<AtomicBool>,
    stage: AtomicU8,
    /// The [`CONNECTION_STATUS_VARIABLE`] entry, created at construction.
    status: Arc<Variable>,
    last_uptime: Mutex<Option<f64>>,
    last_catalog_load: Mutex<Option<Instant>>,
}

// ── Service facade ────────────────────────────────────────────────────────────

/// Owns the supervisor task and exposes the user-facing operations:
/// variables, writes, commands, and collections.
///
/// Dropping the service without calling [`stop`](SyncService::stop) leaves
/// the supervisor running until the runtime shuts down.
pub struct SyncService {
    core: Arc<SyncCore>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl SyncService {
    /// Builds a stopped service around `config`. Call
    /// [`start`](SyncService::start) to begin connecting.
    pub fn new(config: AppConfig) -> Result<SyncService, RegistryError> {
        let registry = Arc::new(VariableRegistry::new());
        let status = registry.get_or_create(CONNECTION_STATUS_VARIABLE, DataType::Int)?;
        status.update_value(Some(Value::Int(0)), true);

        let core = Arc::new(SyncCore {
            config,
            registry,
            catalog: RwLock::new(Catalog::new()),
            scheduler: Mutex::new(CollectionScheduler::new()),
            ledger: Mutex::new(SubscriptionLedger::new()),
            counter: RequestCounter::new(),
            requests: RequestLog::new(),
            link: AsyncMutex::new(None),
            rest: AsyncMutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
            stage: AtomicU8::new(ConnectionStage::Disconnected as u8),
            status,
            last_uptime: Mutex::new(None),
            last_catalog_load: Mutex::new(None),
        });

        Ok(SyncService {
            core,
            supervisor: Mutex::new(None),
        })
    }

    /// Spawns the connection supervisor. A second call while it is running
    /// logs and does nothing.
    pub fn start(&self) {
        let mut slot = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            warn!("sync service already started");
            return;
        }
        self.core.running.store(true, Ordering::Relaxed);
        let core = Arc::clone(&self.core);
        *slot = Some(tokio::spawn(run_supervisor(core)));
    }

    /// Signals the supervisor to stop and waits up to a grace period for it
    /// to wind down. A supervisor that fails to exit in time is detached and
    /// logged, never crashed on.
    pub async fn stop(&self) {
        self.core.running.store(false, Ordering::Relaxed);
        let handle = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            match tokio::time::timeout(STOP_GRACE, handle).await {
                Ok(Ok(())) => info!("sync service stopped"),
                Ok(Err(e)) => warn!("supervisor task failed during shutdown: {e}"),
                Err(_) => warn!("supervisor did not stop within {STOP_GRACE:?}; detaching"),
            }
        }
        self.core.drop_link().await;
        self.core.end_session();
    }

    /// The variable store this service mirrors into.
    pub fn registry(&self) -> Arc<VariableRegistry> {
        Arc::clone(&self.core.registry)
    }

    /// Current connection stage, as also published on the status variable.
    pub fn connection_stage(&self) -> ConnectionStage {
        ConnectionStage::from_u8(self.core.stage.load(Ordering::Relaxed))
    }

    /// Returns (creating it if needed) the variable for `name`.
    ///
    /// The declared type comes from the dataref catalog when the name is
    /// known there; unknown and not-yet-loaded names default to `Float`.
    /// `state:` names are refused.
    pub fn get_variable(&self, name: &str) -> Result<Arc<Variable>, RegistryError> {
        self.core.variable(name)
    }

    /// Sends a one-shot value write. Returns whether the request went out;
    /// there is no write acknowledgment beyond the logged result reply.
    pub async fn write_variable(&self, name: &str, value: Value) -> bool {
        let Some(request) = self.core.build_write(name, &value) else {
            return false;
        };
        self.core.send_now(&request).await
    }

    /// Executes a command as one instantaneous activation.
    pub async fn invoke_command(&self, name: &str) -> bool {
        self.activate(name, true, Some(0.0)).await
    }

    /// Starts holding a command down. Pair with
    /// [`end_command`](SyncService::end_command).
    pub async fn begin_command(&self, name: &str) -> bool {
        self.activate(name, true, None).await
    }

    /// Releases a command held by [`begin_command`](SyncService::begin_command).
    pub async fn end_command(&self, name: &str) -> bool {
        self.activate(name, false, None).await
    }

    async fn activate(&self, name: &str, is_active: bool, duration: Option<f64>) -> bool {
        let Some(request) = self.core.build_activation(name, is_active, duration) else {
            return false;
        };
        self.core.send_now(&request).await
    }

    /// Subscribes to a command's active state. Transitions arrive on the
    /// internal variable `data:command-active:{name}`, which this call
    /// creates up front so listeners can attach immediately.
    pub async fn observe_command(&self, name: &str) -> bool {
        let Some((request, mirror)) = self.core.build_command_observation(name) else {
            return false;
        };
        if let Err(e) = self.core.registry.get_or_create(&mirror, DataType::Int) {
            warn!("could not create {mirror}: {e}");
        }
        self.core.send_now(&request).await
    }

    /// Registers (or replaces) a named collection of variables to refresh.
    /// Members resolve through [`get_variable`](SyncService::get_variable);
    /// unknown catalog names still become variables but are skipped when the
    /// collection reaches the wire.
    pub async fn request_collection(&self, name: &str, paths: &[&str]) {
        self.request_collection_with(name, paths, None, None).await;
    }

    /// [`request_collection`](SyncService::request_collection) with explicit
    /// refresh expiry and stall timeout.
    pub async fn request_collection_with(
        &self,
        name: &str,
        paths: &[&str],
        expire: Option<Duration>,
        stale_timeout: Option<Duration>,
    ) {
        let mut members = Vec::with_capacity(paths.len());
        for path in paths {
            match self.core.variable(path) {
                Ok(variable) => members.push(variable),
                Err(e) => warn!("skipping collection member {path}: {e}"),
            }
        }
        let collection = Collection::new(name, members, expire, stale_timeout);
        let actions = {
            let mut scheduler = self
                .core
                .scheduler
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            scheduler.add_collection(collection)
        };
        let batch = self.core.plan_actions(actions);
        self.core.dispatch(batch).await;
    }

    /// Unregisters a collection, unsubscribing its members first if it is
    /// the one currently on the wire.
    pub async fn release_collection(&self, name: &str) {
        let actions = {
            let mut scheduler = self
                .core
                .scheduler
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            scheduler.remove_collection(name)
        };
        let batch = self.core.plan_actions(actions);
        self.core.dispatch(batch).await;
    }

    /// Attaches a refresh listener to a registered collection. Returns
    /// whether the collection exists.
    pub fn add_collection_listener(
        &self,
        name: &str,
        listener: &Arc<dyn CollectionListener>,
    ) -> bool {
        self.core
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .add_listener(name, listener)
    }

    pub fn remove_collection_listener(
        &self,
        name: &str,
        listener: &Arc<dyn CollectionListener>,
    ) -> bool {
        self.core
            .scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove_listener(name, listener)
    }
}

// ── Core: stage and session state ─────────────────────────────────────────────

impl SyncCore {
    fn set_stage(&self, stage: ConnectionStage) {
        let previous = self.stage.swap(stage as u8, Ordering::Relaxed);
        if previous != stage as u8 {
            debug!("connection stage {} -> {:?}", previous, stage);
            self.status.update_value(Some(stage.as_status_value()), true);
        }
    }

    fn install_catalog(&self, catalog: Catalog) {
        *self
            .catalog
            .write()
            .unwrap_or_else(PoisonError::into_inner) = catalog;
        *self
            .last_catalog_load
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
    }

    /// Resets per-connection bookkeeping when a fresh streaming session
    /// comes up. Collection refresh history survives; it expires on its own
    /// schedule.
    fn begin_stream_session(&self) {
        self.ledger
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.requests.clear();
        *self
            .last_uptime
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_connection();
    }

    fn end_session(&self) {
        self.set_stage(ConnectionStage::Disconnected);
        self.scheduler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .reset_connection();
    }

    async fn drop_link(&self) {
        *self.link.lock().await = None;
        *self.rest.lock().await = None;
    }

    /// See [`SyncService::get_variable`].
    fn variable(&self, name: &str) -> Result<Arc<Variable>, RegistryError> {
        let (base, index) = split_indexed_path(name);
        let data_type = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            match catalog.dataref_by_name(base) {
                Some(meta) if index.is_some() => element_data_type(meta.value_type.data_type()),
                Some(meta) => meta.value_type.data_type(),
                None => DataType::Float,
            }
        };
        self.registry.get_or_create(name, data_type)
    }
}

// ── Core: planning ────────────────────────────────────────────────────────────

impl SyncCore {
    /// Maps variable paths to `(remote id, optional index)` pairs. Internal
    /// and state paths never reach the wire; unknown catalog names and
    /// index suffixes on scalar datarefs are logged and skipped.
    fn resolve_paths<I, S>(&self, paths: I) -> Vec<(u64, Option<usize>)>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        let mut pairs = Vec::new();
        for path in paths {
            let path = path.as_ref();
            if VariableKind::of(path) != VariableKind::Remote {
                debug!("{path} is not a simulator variable; not subscribing");
                continue;
            }
            let (base, index) = split_indexed_path(path);
            match catalog.dataref_by_name(base) {
                Some(meta) => {
                    if index.is_some() && !meta.value_type.is_array() {
                        warn!("{path} indexes a scalar dataref; skipping");
                        continue;
                    }
                    pairs.push((meta.id, index));
                }
                None => warn!("dataref {base} not in simulator catalog; skipping"),
            }
        }
        pairs
    }

    /// Plans the always-on subscription for the clock and uptime datarefs.
    /// `None` when the catalog is missing them (a session against a
    /// stripped-down simulator still streams writes and commands).
    fn plan_core_subscription(&self) -> Option<Outbound> {
        let pairs = self.resolve_paths(CORE_DATAREFS);
        let entries = {
            let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            ledger.subscribe(&pairs)
        };
        if entries.is_empty() {
            warn!("core datarefs unavailable; collection pacing will not run");
            return None;
        }
        let req_id = self.counter.next();
        self.requests.record(req_id, "subscribe core datarefs");
        Some(Outbound {
            request: StreamRequest::subscribe_datarefs(req_id, entries),
            pace: false,
        })
    }

    /// Turns scheduler actions into wire requests, in order. Subscribes and
    /// unsubscribes go through the ledger, so paths already covered (or
    /// still held by another user) produce no traffic.
    fn plan_actions(&self, actions: Vec<SchedulerAction>) -> Vec<Outbound> {
        let mut batch = Vec::new();
        for action in actions {
            match action {
                SchedulerAction::Unsubscribe { collection, paths } => {
                    let pairs = self.resolve_paths(&paths);
                    let entries = {
                        let mut ledger =
                            self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        ledger.unsubscribe(&pairs)
                    };
                    if entries.is_empty() {
                        continue;
                    }
                    let req_id = self.counter.next();
                    self.requests
                        .record(req_id, format!("unsubscribe collection {collection}"));
                    batch.push(Outbound {
                        request: StreamRequest::unsubscribe_datarefs(req_id, entries),
                        pace: true,
                    });
                }
                SchedulerAction::Subscribe { collection, paths } => {
                    let pairs = self.resolve_paths(&paths);
                    let entries = {
                        let mut ledger =
                            self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        ledger.subscribe(&pairs)
                    };
                    if entries.is_empty() {
                        continue;
                    }
                    let req_id = self.counter.next();
                    self.requests
                        .record(req_id, format!("subscribe collection {collection}"));
                    batch.push(Outbound {
                        request: StreamRequest::subscribe_datarefs(req_id, entries),
                        pace: true,
                    });
                }
                SchedulerAction::Completed { collection } => {
                    debug!("collection {collection} refresh cycle closed");
                }
            }
        }
        batch
    }

    /// Handles one inbound reply and returns what must go out in response.
    fn plan_reply(&self, reply: StreamReply) -> ReplyOutcome {
        match reply {
            StreamReply::Result {
                req_id,
                success,
                error_message,
                error_code,
            } => {
                let error = error_message.map(|message| match error_code {
                    Some(code) => format!("{message} ({code})"),
                    None => message,
                });
                match req_id {
                    Some(id) => self.requests.resolve(id, success, error.as_deref()),
                    None if success => debug!("uncorrelated success result"),
                    None => warn!(
                        "uncorrelated request failure: {}",
                        error.as_deref().unwrap_or("no error text")
                    ),
                }
                ReplyOutcome::default()
            }
            StreamReply::CommandUpdateIsActive { data } => {
                self.apply_command_updates(data);
                ReplyOutcome::default()
            }
            StreamReply::DatarefUpdateValues { data } => self.apply_dataref_updates(data),
        }
    }

    fn apply_command_updates(&self, data: HashMap<u64, bool>) {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        for (id, active) in data {
            let Some(meta) = catalog.command_by_id(id) else {
                debug!("active update for unknown command id {id}; safe to ignore");
                continue;
            };
            let mirror = format!("{COMMAND_ACTIVE_PREFIX}{}", meta.name);
            match self.registry.get_or_create(&mirror, DataType::Int) {
                Ok(variable) => {
                    variable.update_value(Some(Value::Int(i64::from(active))), true);
                }
                Err(e) => warn!("could not mirror activity of {}: {e}", meta.name),
            }
        }
    }

    /// Applies one value-update frame and runs the clock/uptime hooks. A
    /// clock update ticks the collection scheduler; an uptime decrease flags
    /// a catalog reload.
    fn apply_dataref_updates(&self, data: HashMap<u64, serde_json::Value>) -> ReplyOutcome {
        let resolved: Vec<(Arc<DatarefMeta>, serde_json::Value)> = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            data.into_iter()
                .filter_map(|(id, raw)| match catalog.dataref_by_id(id) {
                    Some(meta) => Some((meta, raw)),
                    None => {
                        debug!("update for unknown remote id {id}; stale subscription, safe to ignore");
                        None
                    }
                })
                .collect()
        };

        // Coverage decides the shape before the ledger lock is released;
        // the element path re-locks for alignment.
        enum Slice {
            Unsubscribed,
            Whole,
            Elements,
        }

        let mut clock_ticked = false;
        let mut catalog_reload = false;
        for (meta, raw) in &resolved {
            let slice = {
                let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
                match ledger.coverage(meta.id) {
                    None => Slice::Unsubscribed,
                    Some(Coverage::Whole) => Slice::Whole,
                    Some(Coverage::Elements(_)) => Slice::Elements,
                }
            };
            match slice {
                Slice::Unsubscribed => {
                    debug!("update for {} without a live subscription", meta.name);
                }
                Slice::Whole => self.apply_whole_update(meta.as_ref(), raw),
                Slice::Elements => self.apply_element_updates(meta.as_ref(), raw),
            }

            if meta.name == CLOCK_DATAREF {
                clock_ticked = true;
            } else if meta.name == UPTIME_DATAREF {
                if let Some(uptime) = raw.as_f64() {
                    catalog_reload |= self.note_uptime(uptime);
                }
            }
        }

        let outbound = if clock_ticked {
            let actions = {
                let mut scheduler = self
                    .scheduler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                scheduler.tick(Instant::now())
            };
            self.plan_actions(actions)
        } else {
            Vec::new()
        };

        ReplyOutcome {
            outbound,
            catalog_reload,
        }
    }

    fn apply_whole_update(&self, meta: &DatarefMeta, raw: &serde_json::Value) {
        let Some(value) = decode_value(raw, meta.value_type) else {
            warn!("undecodable {} update for {}", meta.value_type, meta.name);
            return;
        };
        match self
            .registry
            .get_or_create(&meta.name, meta.value_type.data_type())
        {
            Ok(variable) => {
                variable.update_value(Some(value), true);
            }
            Err(e) => warn!("could not store update for {}: {e}", meta.name),
        }
    }

    /// Applies a dense element list to the `name[i]` variables it covers.
    /// A length mismatch reconciles against the previous index set once;
    /// beyond that the update is dropped.
    fn apply_element_updates(&self, meta: &DatarefMeta, raw: &serde_json::Value) {
        let Some(values) = raw.as_array() else {
            warn!("expected element list for {}, got a scalar", meta.name);
            return;
        };
        let indices = {
            let ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
            match ledger.align(meta.id, values.len()) {
                Ok(indices) => indices.to_vec(),
                Err(mismatch) => {
                    warn!("dropping update for {}: {mismatch}", meta.name);
                    return;
                }
            }
        };
        let element_type = element_data_type(meta.value_type.data_type());
        for (index, raw_element) in indices.into_iter().zip(values) {
            let Some(value) = decode_element(raw_element, meta.value_type) else {
                warn!("undecodable element {index} of {}", meta.name);
                continue;
            };
            let name = format!("{}[{index}]", meta.name);
            match self.registry.get_or_create(&name, element_type) {
                Ok(variable) => {
                    variable.update_value(Some(value), true);
                }
                Err(e) => warn!("could not store update for {name}: {e}"),
            }
        }
    }

    /// Records a new uptime sample; returns whether it went backwards.
    fn note_uptime(&self, uptime: f64) -> bool {
        let mut last = self
            .last_uptime
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut restarted = false;
        if let Some(previous) = *last {
            if uptime < previous {
                info!(
                    "simulator session restart detected (uptime {previous:.0}s back to {uptime:.0}s)"
                );
                restarted = true;
            }
        }
        *last = Some(uptime);
        restarted
    }

    /// Builds a set request for one variable, or `None` (logged) when the
    /// name is unknown, read-only, or the value does not fit its wire type.
    fn build_write(&self, name: &str, value: &Value) -> Option<StreamRequest> {
        let (base, index) = split_indexed_path(name);
        let write = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            let Some(meta) = catalog.dataref_by_name(base) else {
                warn!("write to unknown dataref {base}");
                return None;
            };
            if !meta.is_writable {
                warn!("dataref {} is not writable", meta.name);
                return None;
            }
            if index.is_some() && !meta.value_type.is_array() {
                warn!("indexed write to scalar dataref {}", meta.name);
                return None;
            }
            let raw = encode_value(value, meta.value_type, index.is_some())?;
            DatarefWrite {
                id: meta.id,
                value: raw,
                index,
            }
        };
        let req_id = self.counter.next();
        self.requests.record(req_id, format!("set {name}"));
        Some(StreamRequest::set_datarefs(req_id, vec![write]))
    }

    fn build_activation(
        &self,
        name: &str,
        is_active: bool,
        duration: Option<f64>,
    ) -> Option<StreamRequest> {
        let id = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            match catalog.command_by_name(name) {
                Some(meta) => meta.id,
                None => {
                    warn!("unknown command {name}");
                    return None;
                }
            }
        };
        let req_id = self.counter.next();
        self.requests
            .record(req_id, format!("command {name} active={is_active}"));
        Some(StreamRequest::activate_command(req_id, id, is_active, duration))
    }

    /// Builds a command-activity subscription plus the name of the internal
    /// variable the transitions will land on.
    fn build_command_observation(&self, name: &str) -> Option<(StreamRequest, String)> {
        let id = {
            let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
            match catalog.command_by_name(name) {
                Some(meta) => meta.id,
                None => {
                    warn!("unknown command {name}");
                    return None;
                }
            }
        };
        let req_id = self.counter.next();
        self.requests
            .record(req_id, format!("observe command {name}"));
        Some((
            StreamRequest::subscribe_commands(req_id, [id]),
            format!("{COMMAND_ACTIVE_PREFIX}{name}"),
        ))
    }
}

// ── Core: I/O ─────────────────────────────────────────────────────────────────

impl SyncCore {
    /// Sends one request on the live link. Offline sends are dropped with a
    /// warning; reconnect re-subscribes from scratch anyway.
    async fn send_now(&self, request: &StreamRequest) -> bool {
        let link = self.link.lock().await;
        match link.as_ref() {
            None => {
                warn!("not connected; dropping {}", request.type_name());
                false
            }
            Some(sender) => match sender.send(request).await {
                Ok(()) => true,
                Err(e) => {
                    warn!("send of {} failed: {e}", request.type_name());
                    false
                }
            },
        }
    }

    async fn dispatch(&self, batch: Vec<Outbound>) {
        for item in batch {
            self.send_now(&item.request).await;
            if item.pace {
                tokio::time::sleep(PACING_DELAY).await;
            }
        }
    }

    async fn handle_reply(&self, reply: StreamReply) {
        let outcome = self.plan_reply(reply);
        if outcome.catalog_reload {
            self.reload_catalog().await;
        }
        self.dispatch(outcome.outbound).await;
    }

    /// Reloads the catalogs over REST after a simulator session restart and
    /// rebuilds the subscription state from nothing: remote ids are not
    /// stable across sessions.
    async fn reload_catalog(&self) {
        {
            let last = self
                .last_catalog_load
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if let Some(at) = *last {
                if at.elapsed() < CATALOG_RELOAD_GUARD {
                    debug!("catalog reloaded {:?} ago; skipping", at.elapsed());
                    return;
                }
            }
        }
        let rest = self.rest.lock().await.clone();
        let Some(rest) = rest else {
            warn!("no REST session for catalog reload");
            return;
        };

        info!("rebuilding catalogs after simulator session restart");
        match rest.load_catalog().await {
            Ok(catalog) => {
                self.install_catalog(catalog);
                self.ledger
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                self.scheduler
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .invalidate_all();
                if let Some(core_sub) = self.plan_core_subscription() {
                    self.dispatch(vec![core_sub]).await;
                }
            }
            Err(e) => warn!("catalog reload failed: {e}; keeping previous metadata"),
        }
    }
}

// ── Value codecs ──────────────────────────────────────────────────────────────

fn element_data_type(array_type: DataType) -> DataType {
    match array_type {
        DataType::IntArray => DataType::Int,
        DataType::FloatArray => DataType::Float,
        DataType::ByteArray => DataType::Byte,
        other => other,
    }
}

/// Decodes a whole-value update into the local value shape.
fn decode_value(raw: &serde_json::Value, value_type: RemoteValueType) -> Option<Value> {
    match value_type {
        RemoteValueType::Int => raw.as_i64().map(Value::Int),
        RemoteValueType::Float | RemoteValueType::Double => raw.as_f64().map(Value::Float),
        RemoteValueType::IntArray => {
            let items = raw.as_array()?;
            items
                .iter()
                .map(serde_json::Value::as_i64)
                .collect::<Option<Vec<i64>>>()
                .map(Value::IntArray)
        }
        RemoteValueType::FloatArray => {
            let items = raw.as_array()?;
            items
                .iter()
                .map(serde_json::Value::as_f64)
                .collect::<Option<Vec<f64>>>()
                .map(Value::FloatArray)
        }
        RemoteValueType::Data => raw.as_str().and_then(decode_base64_text),
    }
}

/// Decodes one element of a dense element list.
fn decode_element(raw: &serde_json::Value, value_type: RemoteValueType) -> Option<Value> {
    match value_type {
        RemoteValueType::IntArray => raw.as_i64().map(Value::Int),
        RemoteValueType::FloatArray => raw.as_f64().map(Value::Float),
        other => decode_value(raw, other),
    }
}

/// String-typed remote values arrive base64-encoded with NUL padding up to
/// the dataref's fixed capacity.
fn decode_base64_text(encoded: &str) -> Option<Value> {
    let bytes = match base64::decode(encoded) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("invalid base64 payload: {e}");
            return None;
        }
    };
    let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    Some(Value::Text(
        String::from_utf8_lossy(&bytes[..end]).into_owned(),
    ))
}

/// Encodes a local value for a set request. `element` marks an indexed
/// write, which must carry a scalar.
fn encode_value(
    value: &Value,
    value_type: RemoteValueType,
    element: bool,
) -> Option<serde_json::Value> {
    match (value, value_type) {
        (Value::Text(text), RemoteValueType::Data) => Some(json!(base64::encode(text))),
        (Value::ByteArray(bytes), RemoteValueType::Data) => Some(json!(base64::encode(bytes))),
        (Value::Int(n), _) => Some(json!(n)),
        (Value::Byte(b), _) => Some(json!(b)),
        (Value::Float(f), _) => Some(json!(f)),
        (Value::IntArray(items), _) if !element => Some(json!(items)),
        (Value::FloatArray(items), _) if !element => Some(json!(items)),
        _ => {
            warn!(
                "{:?} value does not fit a {value_type} dataref",
                value.data_type()
            );
            None
        }
    }
}

// ── Supervisor ────────────────────────────────────────────────────────────────

/// The connection supervisor: runs streaming sessions back to back with a
/// reconnect pause in between, until the stop flag clears or a session fails
/// in a way retrying cannot fix.
async fn run_supervisor(core: Arc<SyncCore>) {
    info!("connection supervisor started");
    let reconnect = Duration::from_secs(core.config.connection.reconnect_interval_secs);

    while core.running.load(Ordering::Relaxed) {
        let outcome = run_session(&core).await;
        core.drop_link().await;
        core.end_session();

        match outcome {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::ConnectionLost) => {
                info!("streaming session ended; reconnecting in {reconnect:?}");
            }
            Err(SessionError::Discovery(DiscoveryError::NotFound { waited })) => {
                debug!("no beacon within {waited:?}; trying again in {reconnect:?}");
            }
            Err(SessionError::Discovery(err @ DiscoveryError::VersionNotSupported { .. })) => {
                error!("{err}; giving up until the service restarts");
                break;
            }
            Err(err) => warn!("connection attempt failed: {err}; retrying in {reconnect:?}"),
        }

        sleep_while_running(&core.running, reconnect).await;
    }

    core.drop_link().await;
    core.end_session();
    info!("connection supervisor stopped");
}

/// One full session: locate the simulator, load catalogs, connect the
/// stream, subscribe the core datarefs, then receive until it ends.
async fn run_session(core: &Arc<SyncCore>) -> Result<SessionEnd, SessionError> {
    let simulator = &core.config.simulator;
    let endpoint = match &simulator.host {
        Some(host) => {
            debug!("discovery disabled; using configured endpoint {host}:{}", simulator.port);
            SimulatorEndpoint {
                host: host.clone(),
                port: simulator.port,
                hostname: host.clone(),
            }
        }
        None => {
            let wait = Duration::from_secs(simulator.beacon_timeout_secs);
            discover_simulator(wait, Arc::clone(&core.running)).await?
        }
    };
    info!(
        "simulator located at {}:{} ({})",
        endpoint.host, endpoint.port, endpoint.hostname
    );
    core.set_stage(ConnectionStage::BeaconReceived);

    let rest = RestClient::negotiate(&endpoint.host, endpoint.port).await?;
    let catalog = rest.load_catalog().await?;
    core.install_catalog(catalog);
    let stream_url = rest.ws_url();
    *core.rest.lock().await = Some(rest);
    core.set_stage(ConnectionStage::CatalogLoaded);

    let (sender, mut source) = ws_client::connect(&stream_url).await?;
    *core.link.lock().await = Some(sender);
    core.set_stage(ConnectionStage::Streaming);

    core.begin_stream_session();
    if let Some(core_sub) = core.plan_core_subscription() {
        core.dispatch(vec![core_sub]).await;
    }

    Ok(receive_loop(core, &mut source).await)
}

/// Receives until the stop flag clears, the peer closes, or the link goes
/// quiet for too many consecutive timeout windows.
///
/// The first window is short so a dead connect attempt is noticed fast;
/// once traffic flows the window widens to the steady timeout.
async fn receive_loop(core: &Arc<SyncCore>, source: &mut WsSource) -> SessionEnd {
    let max_timeouts = core.config.connection.max_receive_timeouts;
    let mut wait = INITIAL_RECEIVE_TIMEOUT;
    let mut quiet_windows: u32 = 0;

    loop {
        if !core.running.load(Ordering::Relaxed) {
            info!("stop requested; leaving receive loop");
            return SessionEnd::Stopped;
        }
        match ws_client::next_reply(source, wait).await {
            Inbound::Reply(reply) => {
                quiet_windows = 0;
                wait = STEADY_RECEIVE_TIMEOUT;
                core.set_stage(ConnectionStage::Receiving);
                core.handle_reply(reply).await;
            }
            Inbound::Skipped => {
                quiet_windows = 0;
            }
            Inbound::TimedOut => {
                if !core.running.load(Ordering::Relaxed) {
                    return SessionEnd::Stopped;
                }
                quiet_windows += 1;
                warn!("no streaming traffic for {wait:?} ({quiet_windows}/{max_timeouts})");
                if quiet_windows >= max_timeouts {
                    warn!("simulator went quiet; forcing a reconnect");
                    return SessionEnd::ConnectionLost;
                }
            }
            Inbound::Closed => {
                info!("streaming connection closed");
                return SessionEnd::ConnectionLost;
            }
        }
    }
}

/// Sleeps `total` in short slices so a stop request cuts the reconnect
/// pause short.
async fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while running.load(Ordering::Relaxed) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(STOP_POLL)).await;
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
