//! # xplink-core
//!
//! Shared library for XPLink containing the reactive variable graph, the
//! formula/RPN engine, the collection scheduler, and the simulator protocol
//! types.
//!
//! This crate is used by the client application and by anything else that
//! embeds the synchronization layer. It has zero dependencies on OS APIs,
//! HTTP stacks, or network sockets.
//!
//! # Architecture overview
//!
//! XPLink mirrors a flight simulator's state onto deck-style control
//! surfaces. The simulator publishes thousands of named, typed values
//! ("datarefs") and invokable commands; a deck page only ever needs a small
//! subset of them, and the streaming protocol can only carry a bounded number
//! of subscriptions at once. This crate defines the pieces that make that
//! work:
//!
//! - **`domain`** – The observable [`Variable`] cells, the registry that owns
//!   them, bounded [`Collection`]s of variables, and the scheduler that
//!   decides which collection is on the wire at any moment.
//!
//! - **`formula`** – Template expressions such as `${sim/foo} 100 *` that
//!   derive a computed value from one or more variables and republish it
//!   through the same notification graph.
//!
//! - **`protocol`** – The wire-facing data layer: the discovery beacon codec,
//!   the JSON streaming envelope, the dataref/command metadata catalog, the
//!   subscription index bookkeeping, and request-id correlation.

pub mod domain;
pub mod formula;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `xplink_core::Variable` instead of `xplink_core::domain::variable::Variable`.
pub use domain::collection::{Collection, CollectionListener, CollectionState};
pub use domain::scheduler::{CollectionScheduler, SchedulerAction};
pub use domain::variable::{
    DataType, Value, Variable, VariableKind, VariableListener, VariableRegistry,
};
pub use formula::{Formula, StateProvider};
pub use protocol::beacon::{parse_beacon, Beacon, BeaconError};
pub use protocol::catalog::{Catalog, CommandMeta, DatarefMeta, RemoteValueType};
pub use protocol::messages::{StreamReply, StreamRequest};
pub use protocol::request::{RequestCounter, RequestLog};
