// cvsift-core - Data model and lifecycle rules for batch execution
//
// Pure types and transition planning: no async, no I/O. The store and engine
// crates consume the guard/patch plans produced here; this crate never talks
// to storage itself.

mod hash;
mod model;
mod transition;

pub use hash::sha256_hex;
pub use model::{
    new_id, BatchCounter, BatchRecord, BatchStatus, ItemFailure, ItemRecord, ItemStatus,
};
pub use transition::{plan, ItemEvent, ItemGuard, ItemPatch, PlannedOutcome, TransitionPlan};
