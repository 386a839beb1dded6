//! Recovery module for settling submitted work.
//!
//! This module provides:
//! - **Reconciliation**: the four-state sentinel classification applied to a
//!   task-list once it has run (or was expected to run)
//! - **Reset**: the operator action that moves submitted work back to stage

mod reconcile;
mod reset;

pub use reconcile::{ReconcileReport, reconcile};
pub use reset::{ResetReport, reset};
