//! Wire-facing data layer: beacon decoding, the streaming JSON envelope,
//! the metadata catalog, subscription bookkeeping, and request-id
//! correlation.
//!
//! Nothing in this module touches a socket. The client crate owns the
//! actual multicast listener, HTTP calls, and WebSocket; these types give
//! it (and its tests) the protocol semantics without any I/O.

pub mod beacon;
pub mod catalog;
pub mod messages;
pub mod request;
pub mod subscriptions;

pub use beacon::{parse_beacon, Beacon, BeaconError};
pub use catalog::{Catalog, CatalogError, CommandMeta, DatarefMeta, RemoteValueType};
pub use messages::*;
pub use request::{RequestCounter, RequestLog};
pub use subscriptions::{
    split_indexed_path, Coverage, IndexMismatch, IndexSet, SubscriptionLedger,
};
