pub mod keys;
pub mod mem;
pub mod traits;
pub mod ttl;
pub mod types;

pub use mem::MemStore;
pub use traits::RankStore;
pub use ttl::TtlGcTask;
pub use types::{Aggregate, CommandResult, Guard, StoreCommand, Transaction, TxnOutcome};
