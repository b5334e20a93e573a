use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::time::SystemTime;

use crc::Crc;
use futures::FutureExt;
use tracing::warn;

use crate::stats;

/// Runs a worker loop until it returns on its own, restarting it after a caught panic.
/// A panicking worker must never take the dispatcher down with it.
pub(crate) async fn run_guarded<F, Fut>(worker: &'static str, mut body: F)
where
    F: FnMut() -> Fut + Send,
    Fut: Future<Output = ()> + Send,
{
    stats::inc_running_workers();

    loop {
        match AssertUnwindSafe(body()).catch_unwind().await {
            Ok(()) => break,
            Err(_) => {
                stats::inc_worker_panics();
                warn!(worker, "worker panicked, restarting");
            }
        }
    }

    stats::dec_running_workers();
}

/// Current wall-clock time in milliseconds since the epoch. All protocol timers are
/// plain millisecond arithmetic on this clock.
pub(crate) fn now_millis() -> i64 {
    match SystemTime::now().duration_since(SystemTime::UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(_) => 0,
    }
}

/// `true` iff `s1` is newer than `s2` in the wrapping u16 sequence space,
/// i.e. `s1 - s2` (unsigned) lies in the first half of the range.
pub(crate) fn greater_than_sequence(s1: u16, s2: u16) -> bool {
    (s1 > s2 && s1 - s2 <= 32768) || (s1 < s2 && s2 - s1 > 32768)
}

/// `true` iff `s1` is newer than `s2` in the wrapping u8 order space.
pub(crate) fn greater_than_order(s1: u8, s2: u8) -> bool {
    (s1 > s2 && s1 - s2 <= 127) || (s1 < s2 && s2 - s1 > 127)
}

/// Symmetric distance between two sequence numbers across the wrap boundary.
pub(crate) fn difference_sequence(s1: u16, s2: u16) -> u16 {
    if s1 >= s2 {
        if s1 - s2 <= 32768 {
            s1 - s2
        }
        else {
            (65535 - s1) + s2
        }
    }
    else {
        difference_sequence(s2, s1)
    }
}

/// 32-bit fingerprint of a peer address (IP bytes followed by the little-endian port),
/// used as the connection registry key.
pub(crate) fn addr_fingerprint(addr: &SocketAddr) -> u32 {
    let hasher = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = hasher.digest();

    match addr.ip() {
        IpAddr::V4(ip) => digest.update(&ip.octets()),
        IpAddr::V6(ip) => digest.update(&ip.octets()),
    }
    digest.update(&(addr.port() as u32).to_le_bytes());

    digest.finalize()
}
