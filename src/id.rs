//! ID generation utilities for jobctl
//!
//! Task and task-list names are derived from the wall clock at microsecond
//! resolution plus a uniqueness suffix, so concurrent stages never collide.

use std::sync::atomic::{AtomicU32, Ordering};

use chrono::Local;
use rand::Rng;

static SEQUENCE: AtomicU32 = AtomicU32::new(0);

/// Current local time formatted as `%Y%m%d%H%M%S%6f`
pub fn timestamp() -> String {
    Local::now().format("%Y%m%d%H%M%S%6f").to_string()
}

/// Generate a unique id
///
/// Format: `{timestamp}-{sequence:04}{random_hex:04x}`
/// Example: `20261016093012123456-0007a1b2`
///
/// The sequence number guards against two calls within the same microsecond
/// in one process; the random part guards against other processes.
pub fn generate_id() -> String {
    let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed) % 10_000;
    let random: u16 = rand::rng().random();
    format!("{}-{:04}{:04x}", timestamp(), seq, random)
}
