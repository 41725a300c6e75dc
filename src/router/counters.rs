//! Router activity counters.
//!
//! Plain process-wide atomics; exporting them to a metrics registry is the
//! embedding process's concern.

use std::sync::atomic::{AtomicU64, Ordering};

pub static MESSAGES_INCOMING: AtomicU64 = AtomicU64::new(0);
pub static MESSAGES_ROUTED: AtomicU64 = AtomicU64::new(0);
pub static MESSAGES_UNMATCHED: AtomicU64 = AtomicU64::new(0);
pub static STORE_ERRORS: AtomicU64 = AtomicU64::new(0);
pub static OVERLOADED_HANDLE_CHANNEL: AtomicU64 = AtomicU64::new(0);
pub static SUBSCRIPTION_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
pub static DUPLICATE_SUBSCRIPTIONS: AtomicU64 = AtomicU64::new(0);
pub static CURRENT_SUBSCRIPTIONS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn add(counter: &AtomicU64, value: u64) {
    counter.fetch_add(value, Ordering::Relaxed);
}

pub(crate) fn decrement(counter: &AtomicU64) {
    counter.fetch_sub(1, Ordering::Relaxed);
}

pub fn value(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}
