//! # xplink-client
//!
//! The XPLink client application: keeps a local variable store synchronized
//! with a running flight simulator over its web API.
//!
//! # What does the client do?
//!
//! The simulator announces itself on a UDP multicast beacon. From one beacon
//! the client runs a full session:
//!
//! 1. Negotiate the web API version over REST and download the dataref and
//!    command catalogs (name → remote id, type, writability).
//! 2. Open the streaming WebSocket and subscribe a small core set of
//!    datarefs: the simulator clock and the uptime counter.
//! 3. Mirror every inbound value update into the [`xplink_core`] variable
//!    registry, where listeners (deck pages, formulas) react to changes.
//! 4. Cycle registered variable collections through the wire one at a time,
//!    paced by the scheduler on every clock tick.
//!
//! If the connection drops, goes quiet, or the simulator restarts its
//! session, the supervisor tears down and rebuilds all of this without
//! losing registered collections or listeners.

/// Application layer: the synchronization service.
pub mod application;

/// Infrastructure layer: discovery, REST, streaming, and configuration.
pub mod infrastructure;

// Re-export the surface a consumer of the client library needs, so embedding
// the service does not require spelling out the layer paths.
pub use application::sync_service::{
    ConnectionStage, SyncService, COMMAND_ACTIVE_PREFIX, CONNECTION_STATUS_VARIABLE,
};
pub use infrastructure::network::beacon::{DiscoveryError, SimulatorEndpoint};
pub use infrastructure::network::rest_client::{ApiVersion, RestClient, RestError};
pub use infrastructure::network::ws_client::{StreamError, StreamSender};
pub use infrastructure::storage::config::{load_config, load_config_from, AppConfig, ConfigError};
