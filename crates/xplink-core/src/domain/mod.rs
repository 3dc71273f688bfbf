//! Domain entities for XPLink.
//!
//! This module contains pure business logic with no infrastructure
//! dependencies: no sockets, no HTTP, no async runtime. Everything here can
//! be constructed and exercised in a plain unit test.
//!
//! # Sub-modules
//!
//! - **`variable`** – The observable value cell at the heart of the system.
//!   A [`variable::Variable`] stores a typed value, counts updates and
//!   changes separately, and notifies weakly-held listeners when its value
//!   actually changes.
//!
//! - **`collection`** – A bounded, named set of variables that is subscribed
//!   to the simulator as one unit. Collections carry the expiry/staleness
//!   bookkeeping the scheduler needs.
//!
//! - **`scheduler`** – The state machine that decides which single collection
//!   is on the wire at any moment. It never touches a socket itself: each
//!   tick returns the subscribe/unsubscribe actions for the connection layer
//!   to apply.

pub mod collection;
pub mod scheduler;
pub mod variable;
