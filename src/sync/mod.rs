//! Reconciliation: diff the library against the vault, then apply the
//! resulting plan with backup, move, and archive semantics.

pub mod backup;
pub mod differ;
pub mod executor;

pub use backup::snapshot_vault;
pub use differ::compute_plan;
pub use executor::{ApplyOptions, ReconciliationExecutor};
