//! 事务性修订：变更分组、原子应用与逆序回滚

pub mod amendments;
pub mod change;
pub mod txn;

pub use amendments::{atomic_groups, linked_groups, Linked};
pub use change::{AppliedChange, Change, ChangeApplier, Compensation};
pub use txn::{unwind, RollbackReport, Transaction, TransactionError, TransactionStatus};
