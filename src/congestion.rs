use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::config::Config;
use crate::util;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CongestionMode {
    /// no RTT sample seen yet
    None,
    Good,
    Bad,
}

/// Per-connection congestion controller. Each acknowledged round trip feeds an
/// exponentially smoothed RTT estimate; a sample above the congestion threshold degrades
/// the mode to bad, which stretches the resend/reack timers, shrinks the resend budget
/// and sheds a fraction of unreliable traffic. The connection must then stay clean for
/// `required_time` before recovering - a penalty that doubles on quick relapses and
/// halves after long clean intervals.
pub(crate) struct CongestionHandler {
    config: Arc<Config>,
    inner: Mutex<Inner>,
}

struct Inner {
    mode: CongestionMode,
    rtt: i64,

    last_change_time: i64,
    required_time: i64,

    unreliable_count: u8,

    resend_timeout: i64,
    max_packet_resends: i64,
    reack_timeout: i64,
}

impl CongestionHandler {
    pub fn new(config: Arc<Config>) -> CongestionHandler {
        let mut inner = Inner {
            mode: CongestionMode::None,
            rtt: 0,
            last_change_time: 0,
            required_time: config.default_congestion_required_time.as_millis() as i64,
            unreliable_count: 0,
            resend_timeout: 0,
            max_packet_resends: 0,
            reack_timeout: 0,
        };
        Self::change_mode(&mut inner, &config, CongestionMode::None);

        CongestionHandler {
            config,
            inner: Mutex::new(inner),
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        Self::change_mode(&mut inner, &self.config, CongestionMode::None);
        inner.rtt = 0;
        inner.required_time = self.config.default_congestion_required_time.as_millis() as i64;
        inner.unreliable_count = 0;
    }

    /// Feeds one acknowledged round trip (identified by its send time) into the
    /// estimate and evaluates the mode transitions.
    pub fn check(&self, send_time: i64) {
        let now = util::now_millis();
        let sample = now - send_time;

        let mut inner = self.inner.lock().unwrap();

        if inner.rtt == 0 {
            inner.rtt = sample;
        }
        else {
            inner.rtt += ((sample - inner.rtt) as f32 * self.config.rtt_smooth_factor) as i64;
        }

        let congestion_threshold = self.config.congestion_threshold.as_millis() as i64;

        match inner.mode {
            CongestionMode::None => {
                Self::change_mode(&mut inner, &self.config, CongestionMode::Good);
            }
            CongestionMode::Good => {
                if sample > congestion_threshold {
                    if now - inner.last_change_time
                        <= self.config.bad_rtt_punish_timeout.as_millis() as i64
                    {
                        let max = self.config.max_congestion_required_time.as_millis() as i64;
                        inner.required_time = (inner.required_time * 2).min(max);
                        debug!(required_time = inner.required_time, "quick congestion relapse, doubling recovery time");
                    }

                    Self::change_mode(&mut inner, &self.config, CongestionMode::Bad);
                }
                else if now - inner.last_change_time
                    >= self.config.good_rtt_reward_interval.as_millis() as i64
                {
                    inner.required_time = (inner.required_time / 2).max(1);
                    inner.last_change_time = now;
                }
            }
            CongestionMode::Bad => {
                if sample > congestion_threshold {
                    inner.last_change_time = now;
                }

                if now - inner.last_change_time >= inner.required_time {
                    Self::change_mode(&mut inner, &self.config, CongestionMode::Good);
                }
            }
        }
    }

    fn change_mode(inner: &mut Inner, config: &Config, mode: CongestionMode) {
        match mode {
            CongestionMode::None | CongestionMode::Good => {
                inner.resend_timeout = config.resend_timeout.as_millis() as i64;
                inner.max_packet_resends = config.max_packet_resends;
                inner.reack_timeout = config.reack_timeout.as_millis() as i64;
            }
            CongestionMode::Bad => {
                inner.resend_timeout = (config.resend_timeout.as_millis() as f32
                    * config.bad_mode_multiplier) as i64;
                inner.max_packet_resends =
                    (config.max_packet_resends as f32 / config.bad_mode_multiplier) as i64;
                inner.reack_timeout =
                    (config.reack_timeout.as_millis() as f32 * config.bad_mode_multiplier) as i64;
            }
        }

        if inner.mode != mode {
            debug!(?mode, "congestion mode change");
        }
        inner.mode = mode;
        inner.last_change_time = util::now_millis();
    }

    /// In bad mode, votes to shed every Nth unreliable packet.
    pub fn should_drop_unreliable(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();

        match inner.mode {
            CongestionMode::Bad => {
                inner.unreliable_count = inner.unreliable_count.wrapping_add(1);
                inner.unreliable_count % self.config.congestion_packet_reduction == 0
            }
            _ => false,
        }
    }

    pub fn resend_timeout(&self) -> i64 {
        self.inner.lock().unwrap().resend_timeout
    }

    pub fn max_packet_resends(&self) -> i64 {
        self.inner.lock().unwrap().max_packet_resends
    }

    pub fn reack_timeout(&self) -> i64 {
        self.inner.lock().unwrap().reack_timeout
    }

    /// Estimated one-way latency in milliseconds.
    pub fn ping(&self) -> i16 {
        (self.inner.lock().unwrap().rtt / 2) as i16
    }

    #[cfg(test)]
    fn rtt(&self) -> i64 {
        self.inner.lock().unwrap().rtt
    }

    #[cfg(test)]
    fn required_time(&self) -> i64 {
        self.inner.lock().unwrap().required_time
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn handler() -> CongestionHandler {
        CongestionHandler::new(Arc::new(Config::default()))
    }

    fn sample(handler: &CongestionHandler, rtt_millis: i64) {
        handler.check(util::now_millis() - rtt_millis);
    }

    #[test]
    fn test_first_sample_assigned_directly() {
        let handler = handler();

        sample(&handler, 80);
        assert!((75..=85).contains(&handler.rtt()));
        assert_eq!(handler.ping(), (handler.rtt() / 2) as i16);
    }

    #[test]
    fn test_rtt_smoothing_moves_slowly() {
        let handler = handler();

        sample(&handler, 100);
        sample(&handler, 200);

        // second sample only pulls the estimate by the smoothing factor
        assert!((105..=120).contains(&handler.rtt()), "rtt was {}", handler.rtt());
    }

    #[test]
    fn test_good_mode_timers_unscaled() {
        let handler = handler();
        sample(&handler, 50);

        assert_eq!(handler.resend_timeout(), 50);
        assert_eq!(handler.max_packet_resends(), 15);
        assert_eq!(handler.reack_timeout(), 50);
        assert!(!handler.should_drop_unreliable());
    }

    #[test]
    fn test_congestion_escalation() {
        let handler = handler();
        sample(&handler, 50);

        // a 300ms sample in good mode degrades to bad and scales the derived outputs
        sample(&handler, 300);

        assert_eq!(handler.resend_timeout(), 125);
        assert_eq!(handler.max_packet_resends(), 6);
        assert_eq!(handler.reack_timeout(), 125);

        // every 4th unreliable packet is shed
        let verdicts = (0..8).map(|_| handler.should_drop_unreliable()).collect::<Vec<_>>();
        assert_eq!(verdicts, vec![false, false, false, true, false, false, false, true]);
    }

    #[test]
    fn test_quick_relapse_doubles_required_time() {
        let handler = handler();
        sample(&handler, 50);

        let before = handler.required_time();
        sample(&handler, 300);
        assert_eq!(handler.required_time(), before * 2);
    }

    #[test]
    fn test_required_time_clamped() {
        let mut config = Config::default();
        config.max_congestion_required_time = Duration::from_millis(6000);
        let handler = CongestionHandler::new(Arc::new(config));

        sample(&handler, 50);
        sample(&handler, 300);
        assert_eq!(handler.required_time(), 6000);
    }

    #[test]
    fn test_bad_mode_recovers_after_required_time() {
        let mut config = Config::default();
        config.default_congestion_required_time = Duration::from_millis(0);
        // keep the doubled penalty at zero as well
        config.max_congestion_required_time = Duration::from_millis(0);
        let handler = CongestionHandler::new(Arc::new(config));

        sample(&handler, 50);
        sample(&handler, 300);
        assert_eq!(handler.max_packet_resends(), 6);

        // with a zero required time, the next clean sample flips back to good
        sample(&handler, 50);
        assert_eq!(handler.max_packet_resends(), 15);
        assert!(!handler.should_drop_unreliable());
    }

    #[test]
    fn test_reset_returns_to_initial_state() {
        let handler = handler();
        sample(&handler, 50);
        sample(&handler, 300);

        handler.reset();
        assert_eq!(handler.rtt(), 0);
        assert_eq!(handler.resend_timeout(), 50);
        assert_eq!(handler.required_time(), 4000);
        assert!(!handler.should_drop_unreliable());
    }
}
