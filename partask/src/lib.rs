//!
//! partask: a value-oriented parallel task runtime.
//!
//! Work is submitted as plain closures (`fork`), combined with ordinary
//! function application (`map`), and awaited with ordinary function calls
//! (`join`) — there is no `async`/`await` here, and no explicit executor
//! loop for callers to drive. A [`Compactor`] amortizes per-task overhead
//! when a computation produces many small units of work, and a
//! [`tree::ParallelTree`] turns a node-expansion function into a lazy,
//! backpressured leaf sequence.
//!
//! Most programs can use the process-wide runtime in [`global`] rather than
//! constructing a [`Runtime`] directly.

mod cell;
mod compactor;
mod error;
mod future;
mod group;
mod once;
mod queue;
mod scheduler;
mod tree;

pub mod global;

pub use cell::SyncCell;
pub use compactor::{Compactor, CompactIter, FoldDirection, PrimeConfig, ScaleConfig};
pub use error::{BoxError, PartaskError, StringError};
pub use future::{Future, Outcome, TaskId};
pub use group::{CancelReason, Group, GroupId};
pub use scheduler::{Runtime, RuntimeBuilder};
pub use tree::{coarsen_expand, compute_tree, LeafChannel, NodeOutcome, ParallelTree, TreeLeaves};
