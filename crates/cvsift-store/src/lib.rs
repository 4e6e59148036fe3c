// cvsift-store - Storage gateways for the batch engine
//
// Two gateways, both injected as values so tests can substitute fakes:
// - ObjectStore: raw file bytes behind an OpenDAL operator (fs, s3, memory)
// - StateStore: batch/item records with atomic conditional writes, the single
//   point of cross-task synchronization

mod memory;
mod object;
mod state;

pub use memory::MemoryStateStore;
pub use object::ObjectStore;
pub use state::{CancelSweep, StateStore, StoreError, UpdateOutcome};
