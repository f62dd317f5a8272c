//! Persistence contracts.
//!
//! One module per table family.  Statement builders are pure functions:
//! they take explicit timestamps and return [`Statement`]s or
//! [`MergeStatement`]s, so the test suite asserts the exact SQL and binds
//! without a warehouse.  The orchestrator batches the built statements
//! through the shared driver (per-broadcast snapshot writes go through
//! `Warehouse::run_in_transaction`).

pub mod broadcasts;
pub mod categories;
pub mod events;
pub mod persons;
pub mod snapshots;
pub mod stats;
