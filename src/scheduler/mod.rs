//! Scheduler module for packing staged work into task-lists.
//!
//! The budget of one task-list is `ncpus × maxcpuhours × 3600` CPU seconds.
//! Packing is greedy and permissive: a batch is closed only after it has
//! overflowed, which keeps large task sets moving forward.
//!
//! # Example
//!
//! ```ignore
//! use jobctl::scheduler::Batcher;
//!
//! let batcher = Batcher::new(&store, config.cpu_seconds_ceiling());
//! for tasklist in batcher.batch_staged()? {
//!     println!("{}: {} tasks", tasklist.name, tasklist.tasks.len());
//! }
//! ```

mod batcher;

pub use batcher::{Batch, Batcher, pack};
