//! Derived values over the variable graph.
//!
//! Three layers, bottom up: [`rpn`] evaluates postfix arithmetic,
//! [`template`] classifies expression text and substitutes `${...}` tokens,
//! and [`Formula`] wires both into the notification graph so a computed
//! value updates itself whenever a dependency changes.

pub mod rpn;
pub mod template;

mod formula;

pub use formula::{Formula, FormulaError, StateProvider};
