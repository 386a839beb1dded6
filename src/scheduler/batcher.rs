//! Batcher for packing staged tasks into task-lists.
//!
//! One left-to-right greedy pass over the store's listing order. A task is
//! always added to the current batch first; the batch is closed once its
//! total strictly exceeds the ceiling. Non-final batches therefore end at or
//! slightly above the ceiling, and a task larger than the ceiling forms a
//! batch on its own.

use log::{debug, info};

use crate::error::Result;
use crate::id::generate_id;
use crate::store::{TaskEntry, TaskList, TaskStore};

/// A planned group of items and their summed eta.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub items: Vec<T>,
    pub eta: f64,
}

impl<T> Batch<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            eta: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Pack `(item, eta)` pairs into batches against `ceiling` seconds.
pub fn pack<T>(items: impl IntoIterator<Item = (T, f64)>, ceiling: f64) -> Vec<Batch<T>> {
    let mut batches = Vec::new();
    let mut current = Batch::new();

    for (item, eta) in items {
        current.items.push(item);
        current.eta += eta;
        if current.eta > ceiling {
            batches.push(std::mem::replace(&mut current, Batch::new()));
        }
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Turns staged tasks into submitted task-lists.
pub struct Batcher<'a> {
    store: &'a TaskStore,
    ceiling: f64,
}

impl<'a> Batcher<'a> {
    /// Create a batcher with a ceiling in CPU seconds.
    pub fn new(store: &'a TaskStore, ceiling: f64) -> Self {
        Self { store, ceiling }
    }

    pub fn ceiling(&self) -> f64 {
        self.ceiling
    }

    /// Plan batches over the currently staged tasks without moving anything.
    pub fn plan(&self) -> Result<Vec<Batch<TaskEntry>>> {
        let mut staged = Vec::new();
        for (i, entry) in self.store.list_staged()?.enumerate() {
            if i % 10_000 == 0 && i > 0 {
                debug!("Listed {} staged tasks", i);
            }
            let entry = entry?;
            let eta = entry.eta;
            staged.push((entry, eta));
        }
        info!("Found {} staged tasks", staged.len());

        let batches = pack(staged, self.ceiling);
        info!("Packaged them into {} task-lists (ceiling {}s)", batches.len(), self.ceiling);
        Ok(batches)
    }

    /// Move a planned batch into the submitted area and write its manifest.
    ///
    /// The manifest only appears once every task has been moved.
    pub fn submit_batch(&self, batch: Batch<TaskEntry>) -> Result<TaskList> {
        let name = generate_id();
        let mut tasks = Vec::with_capacity(batch.len());
        for entry in &batch.items {
            tasks.push(self.store.move_to_submitted(&entry.name)?);
        }
        let manifest = self.store.write_tasklist(&name, &tasks)?;
        debug!("Wrote task-list {} with {} tasks ({}s)", name, tasks.len(), batch.eta);
        Ok(TaskList {
            name,
            manifest,
            tasks,
            eta: batch.eta,
        })
    }

    /// Plan and submit all staged work.
    pub fn batch_staged(&self) -> Result<Vec<TaskList>> {
        self.plan()?
            .into_iter()
            .map(|batch| self.submit_batch(batch))
            .collect()
    }
}
