//! Persistent storage for the client application.
//!
//! Currently just the TOML configuration file; see [`config`].

pub mod config;
