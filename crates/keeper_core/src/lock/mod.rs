//! Locking primitives of the access coordinator.
//!
//! - [`ProcessLock`]: cross-process main/request lock files
//! - [`ReentrantLock`]: in-process reentrant locks reporting waiters
//!
//! The repository composes these into scoped [`crate::AccessGuard`]s.
//! Locks are always taken in the order update, operation, open.

mod process;
mod reentrant;

pub use process::ProcessLock;
pub use reentrant::{ReentrantGuard, ReentrantLock};
