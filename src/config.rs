use std::time::Duration;

use anyhow::bail;

/// All protocol tunables, read-only after construction. An endpoint takes the config as
/// `Arc<Config>` and hands it to every connection it creates.
///
/// The defaults are tuned for interactive traffic (games) on consumer links; for most
/// applications only `protocol_id` and possibly `timeout_threshold` need adjusting.
pub struct Config {
    /// Maximum datagram size in bytes, header included. Every sent buffer must fit into
    /// a single datagram of this size; there is no fragmentation.
    pub mtu: usize,

    /// Identification byte carried by every packet to filter out unrelated traffic.
    pub protocol_id: u8,

    /// Number of listener worker tasks reading from the socket.
    pub parallel_listener_count: usize,

    /// Capacity of the per-connection send and receive queues. When a queue is full the
    /// oldest entry is discarded.
    pub max_send_receive_queue_size: usize,

    /// Maximum number of reliable-ordered packets buffered while waiting for a missing
    /// predecessor. When exceeded, the lowest buffered packet is dropped.
    pub max_packet_chain_length: u8,

    /// Size of the ring that remembers received reliable sequence numbers for duplicate
    /// suppression and ack-bitfield assembly. Must be chosen so that every slot is
    /// overwritten at least twice within the sequence space
    /// (`65536 % size > 32 && 65536 / size >= 2`), otherwise acks mis-report.
    pub sequence_buffer_size: u16,

    /// Maximum forward jump of the highest-seen remote sequence during packet loss.
    /// Must stay below the 32-bit ack window.
    pub max_skipped_packets: u16,

    /// Tick interval of the send worker. Should be well below the other timeouts.
    pub update_loop_timeout: Duration,

    /// Age after which an unacknowledged reliable packet stops being resent.
    pub send_remove_timeout: Duration,

    /// Silence on the ordered chain after which a missing predecessor is skipped.
    pub chain_skip_timeout: Duration,

    /// Every this many ack ticks, an empty reliable packet is sent as well so RTT
    /// estimation keeps running under a silent application.
    pub auto_ping_interval: u8,

    /// Connection times out after this much silence from the peer.
    pub timeout_threshold: Duration,

    /// Connection times out when the estimated ping exceeds this value (milliseconds).
    pub max_ping: i16,

    /// Exponential smoothing factor for the RTT estimate.
    pub rtt_smooth_factor: f32,

    /// RTT sample (milliseconds) above which the congestion mode degrades.
    pub congestion_threshold: Duration,

    /// Clean interval after which a good connection's recovery penalty is halved.
    pub good_rtt_reward_interval: Duration,

    /// Relapse window: degrading again within it doubles the recovery penalty.
    pub bad_rtt_punish_timeout: Duration,

    /// Upper clamp for the recovery penalty.
    pub max_congestion_required_time: Duration,

    /// Initial time a connection must stay clean to leave bad mode.
    pub default_congestion_required_time: Duration,

    /// In bad mode, every Nth unreliable packet is shed.
    pub congestion_packet_reduction: u8,

    /// Multiplier applied to resend/reack timers (and divisor for the resend budget)
    /// while in bad mode.
    pub bad_mode_multiplier: f32,

    /// Base interval between resend sweeps.
    pub resend_timeout: Duration,

    /// Base number of packets resent per sweep.
    pub max_packet_resends: i64,

    /// Base interval after which an ack packet is emitted even without reliable traffic.
    pub reack_timeout: Duration,

    /// Number of MTU-sized read buffers kept pooled.
    pub buffer_pool_size: usize,

    /// Number of connection records kept pooled.
    pub connection_pool_size: usize,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            mtu: 1024,
            protocol_id: 231,
            parallel_listener_count: 4,
            max_send_receive_queue_size: 100,
            max_packet_chain_length: 255,
            sequence_buffer_size: 200,
            max_skipped_packets: 25,
            update_loop_timeout: Duration::from_millis(10),
            send_remove_timeout: Duration::from_millis(1600),
            chain_skip_timeout: Duration::from_millis(3000),
            auto_ping_interval: 15,
            timeout_threshold: Duration::from_millis(4000),
            max_ping: 150,
            rtt_smooth_factor: 0.1,
            congestion_threshold: Duration::from_millis(250),
            good_rtt_reward_interval: Duration::from_millis(10_000),
            bad_rtt_punish_timeout: Duration::from_millis(10_000),
            max_congestion_required_time: Duration::from_millis(60_000),
            default_congestion_required_time: Duration::from_millis(4000),
            congestion_packet_reduction: 4,
            bad_mode_multiplier: 2.5,
            resend_timeout: Duration::from_millis(50),
            max_packet_resends: 15,
            reack_timeout: Duration::from_millis(50),
            buffer_pool_size: 64,
            connection_pool_size: 16,
        }
    }
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 10 {
            bail!("mtu of {} cannot hold the fixed packet header", self.mtu);
        }
        if self.parallel_listener_count == 0 {
            bail!("at least one listener worker is required");
        }
        if self.max_send_receive_queue_size == 0 {
            bail!("send/receive queues need a non-zero capacity");
        }
        if self.sequence_buffer_size == 0
            || 65536 % self.sequence_buffer_size as u32 <= 32
            || 65536 / (self.sequence_buffer_size as u32) < 2
        {
            bail!(
                "sequence buffer size {} violates the overwrite discipline (65536 % size > 32 && 65536 / size >= 2)",
                self.sequence_buffer_size
            );
        }
        if self.max_skipped_packets >= 32 {
            bail!("max skipped packets must stay below the 32-bit ack window");
        }
        if self.congestion_packet_reduction == 0 {
            bail!("congestion packet reduction must be non-zero");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[rstest]
    #[case::tiny_mtu(|c: &mut Config| c.mtu = 9)]
    #[case::no_listeners(|c: &mut Config| c.parallel_listener_count = 0)]
    #[case::no_queue(|c: &mut Config| c.max_send_receive_queue_size = 0)]
    #[case::zero_seq_buffer(|c: &mut Config| c.sequence_buffer_size = 0)]
    #[case::seq_buffer_divides_range(|c: &mut Config| c.sequence_buffer_size = 256)]
    #[case::seq_buffer_too_big(|c: &mut Config| c.sequence_buffer_size = 40000)]
    #[case::skip_window(|c: &mut Config| c.max_skipped_packets = 32)]
    #[case::zero_reduction(|c: &mut Config| c.congestion_packet_reduction = 0)]
    fn test_validate_rejects(#[case] break_it: fn(&mut Config)) {
        let mut config = Config::default();
        break_it(&mut config);
        assert!(config.validate().is_err());
    }
}
