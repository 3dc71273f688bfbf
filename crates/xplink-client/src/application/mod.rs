//! Application layer use cases for the client.
//!
//! - **`sync_service`** – The one use case this binary exists for: keep a
//!   local [`xplink_core::VariableRegistry`] synchronized with a running
//!   simulator. It owns the connection supervisor, turns scheduler decisions
//!   and inbound updates into wire traffic, and exposes the variable, write,
//!   command, and collection operations consumers call.

pub mod sync_service;

pub use sync_service::{
    ConnectionStage, SyncService, COMMAND_ACTIVE_PREFIX, CONNECTION_STATUS_VARIABLE,
};
