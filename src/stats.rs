//! Process-wide protocol counters. All counters are atomics that are incremented from
//! worker tasks without any coordination; [`snapshot`] reads them at a single point in
//! time (per counter, not across counters).

use std::sync::atomic::{AtomicU64, Ordering};

static SEND_BYTES: AtomicU64 = AtomicU64::new(0);
static RECEIVED_BYTES: AtomicU64 = AtomicU64::new(0);
static PROCESSED_BYTES: AtomicU64 = AtomicU64::new(0);

static RUNNING_WORKERS: AtomicU64 = AtomicU64::new(0);
static WORKER_PANICS: AtomicU64 = AtomicU64::new(0);

static CONNECTS: AtomicU64 = AtomicU64::new(0);
static DENIED_CONNECTS: AtomicU64 = AtomicU64::new(0);
static DISCONNECTS: AtomicU64 = AtomicU64::new(0);
static TIMEOUTS: AtomicU64 = AtomicU64::new(0);

pub(crate) fn add_send_bytes(n: u64) {
    SEND_BYTES.fetch_add(n, Ordering::Relaxed);
}
pub(crate) fn add_received_bytes(n: u64) {
    RECEIVED_BYTES.fetch_add(n, Ordering::Relaxed);
}
pub(crate) fn add_processed_bytes(n: u64) {
    PROCESSED_BYTES.fetch_add(n, Ordering::Relaxed);
}

pub(crate) fn inc_running_workers() {
    RUNNING_WORKERS.fetch_add(1, Ordering::Relaxed);
}
pub(crate) fn dec_running_workers() {
    RUNNING_WORKERS.fetch_sub(1, Ordering::Relaxed);
}
pub(crate) fn inc_worker_panics() {
    WORKER_PANICS.fetch_add(1, Ordering::Relaxed);
}

pub(crate) fn inc_connects() {
    CONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub(crate) fn inc_denied_connects() {
    DENIED_CONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub(crate) fn inc_disconnects() {
    DISCONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub(crate) fn inc_timeouts() {
    TIMEOUTS.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time copy of all protocol counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// total bytes handed to the socket for sending
    pub send_bytes: u64,
    /// total bytes received with a valid header (before per-connection processing)
    pub received_bytes: u64,
    /// total bytes queued onto a connection for processing
    pub processed_bytes: u64,
    /// currently running worker tasks (listeners plus per-connection workers)
    pub running_workers: u64,
    /// caught worker panics
    pub worker_panics: u64,
    /// successful connection attempts
    pub connects: u64,
    /// connection attempts rejected by the validation hook
    pub denied_connects: u64,
    /// disconnects of any kind
    pub disconnects: u64,
    /// keep-alive timeouts
    pub timeouts: u64,
}

/// Read all counters.
pub fn snapshot() -> StatsSnapshot {
    StatsSnapshot {
        send_bytes: SEND_BYTES.load(Ordering::Relaxed),
        received_bytes: RECEIVED_BYTES.load(Ordering::Relaxed),
        processed_bytes: PROCESSED_BYTES.load(Ordering::Relaxed),
        running_workers: RUNNING_WORKERS.load(Ordering::Relaxed),
        worker_panics: WORKER_PANICS.load(Ordering::Relaxed),
        connects: CONNECTS.load(Ordering::Relaxed),
        denied_connects: DENIED_CONNECTS.load(Ordering::Relaxed),
        disconnects: DISCONNECTS.load(Ordering::Relaxed),
        timeouts: TIMEOUTS.load(Ordering::Relaxed),
    }
}
