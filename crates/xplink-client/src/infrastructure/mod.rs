//! Infrastructure layer for the client application.
//!
//! Contains everything that touches a socket or the filesystem.
//!
//! **Dependency rule**: this layer may depend on `xplink_core`, but MUST NOT
//! be imported by the core domain layers; `application` composes the two.
//!
//! # Sub-modules
//!
//! - **`network`** – The three legs of a simulator session: UDP multicast
//!   beacon discovery, the REST catalog/capability client, and the streaming
//!   WebSocket transport.
//!
//! - **`storage`** – TOML configuration in the platform config directory.

pub mod network;
pub mod storage;
