// Tidemark Kernel
//
// Transactional commits, checkpoints, and rollback over a versioned
// snapshot table.

pub mod adapters;
pub mod commit;
pub mod invariants;
pub mod log;
pub mod replay;
pub mod retry;
pub mod rollback;
pub mod state;
pub mod table;
pub mod tags;
pub mod transaction;
