//! Transactions over versioned maps.
//!
//! - [`TransactionManager`] hands out ids, tracks live transactions per
//!   scheduler and knows the oldest repeatable-read snapshot.
//! - [`Transaction`] owns an undo log of the rows it wrote; commit logs the
//!   final value of every row to the redo log and then publishes the rows,
//!   rollback replays the undo log newest first.
//! - [`TransactionMap`] is a map as seen through one transaction.
//!
//! Row locks are the uncommitted slots themselves: a row with a pending
//! write by another transaction is `Locked`. There is no deadlock
//! detector; waits are bounded by the lock timeout.

mod handle;
mod manager;
mod map;
mod state;

pub use handle::Transaction;
pub use manager::TransactionManager;
pub use map::{TransactionCursor, TransactionMap};
pub use state::{TransactionOptions, TransactionState};
