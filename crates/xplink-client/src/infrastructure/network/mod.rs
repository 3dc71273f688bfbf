//! Network infrastructure: discovery, REST, and streaming.
//!
//! A session runs through these in order:
//! - `beacon` waits on the UDP multicast group until a simulator announces
//!   itself (or a configured endpoint skips the wait entirely).
//! - `rest_client` negotiates the API version, then pulls the dataref and
//!   command catalogs over HTTP.
//! - `ws_client` holds the long-lived WebSocket that all subscriptions,
//!   writes, and updates travel over.
//!
//! None of these modules keep protocol state; that lives in the application
//! layer's service, which drives them.

pub mod beacon;
pub mod rest_client;
pub mod ws_client;
