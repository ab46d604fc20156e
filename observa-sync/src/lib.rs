//! # observa-sync
//!
//! The reconciliation core: key-set diffing per resource kind, scoping-group
//! resolution, and the sink adapters the engine writes through.
//!
//! Call [`cycle::run_cycle`] for one full collect → resolve → diff → apply
//! pass; it is the canonical entrypoint for both the periodic scheduler and
//! the manual trigger.

pub mod cycle;
pub mod diff;
pub mod error;
pub mod resolver;
pub mod sink;

pub use cycle::run_cycle;
pub use error::SinkError;
pub use sink::{open_sink, SinkAdapter, SyncMode};
