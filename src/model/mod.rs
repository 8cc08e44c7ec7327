//! Core data model.
//!
//! A contract is the unit of work: one uploaded document moving through
//! extraction, validation, PO generation and notification. Tasks are the
//! queued units that move it.

pub mod contract;
pub mod task;

pub use contract::*;
pub use task::*;
