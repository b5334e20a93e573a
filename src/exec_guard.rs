use std::sync::Mutex;

use rustc_hash::FxHashSet;

/// Idempotence gate for the connect phase, keyed by the peer's address fingerprint.
/// While a fingerprint is held, further connect packets from the same peer are dropped;
/// the holder releases it once the handshake completes.
pub(crate) struct ExecGuard {
    executions: Mutex<FxHashSet<u32>>,
}

impl ExecGuard {
    pub fn new() -> ExecGuard {
        ExecGuard {
            executions: Mutex::new(FxHashSet::default()),
        }
    }

    /// Claims the id. Returns `true` only for the first claimant.
    pub fn try_execute(&self, id: u32) -> bool {
        self.executions.lock().unwrap().insert(id)
    }

    pub fn finish(&self, id: u32) {
        self.executions.lock().unwrap().remove(&id);
    }
}
