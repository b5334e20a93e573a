use std::collections::VecDeque;
use std::sync::Mutex;

use crate::packet::Packet;
use crate::util;

/// Verdict of the [`SendBuffer::iterate`] visitor for the entry it was shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SendBufferOp {
    /// unlink the entry (packet abandoned or handled)
    Delete,
    /// stop the iteration
    Cancel,
    /// keep going
    Continue,
}

/// A reliable packet waiting for its acknowledgement.
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    pub packet: Packet,
    pub send_time: i64,

    /// set for packets first sent before the connection was fully established, whose
    /// round trips must not feed the RTT estimate
    pub no_rtt: bool,
}

/// The ordered collection of in-flight reliable packets. Insertion order is send order;
/// the resend sweep visits oldest first, and retrieval by sequence removes the entry
/// (an acked packet is never resent).
pub(crate) struct SendBuffer {
    inner: Mutex<VecDeque<SentPacket>>,
}

impl SendBuffer {
    pub fn new() -> SendBuffer {
        SendBuffer {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, packet: Packet, no_rtt: bool) {
        self.inner.lock().unwrap().push_back(SentPacket {
            packet,
            send_time: util::now_millis(),
            no_rtt,
        });
    }

    /// Linear scan for the given sequence; on match the entry is unlinked and returned.
    pub fn retrieve(&self, sequence: u16) -> Option<SentPacket> {
        let mut inner = self.inner.lock().unwrap();

        let position = inner
            .iter()
            .position(|sent| sent.packet.sequence == sequence)?;
        inner.remove(position)
    }

    /// Visits entries in insertion order. The visitor is given the running index of the
    /// visit (deleted entries count too) and decides per entry.
    pub fn iterate(&self, mut visitor: impl FnMut(usize, &SentPacket) -> SendBufferOp) {
        let mut inner = self.inner.lock().unwrap();

        let mut index = 0;
        let mut position = 0;
        while position < inner.len() {
            match visitor(index, &inner[position]) {
                SendBufferOp::Delete => {
                    inner.remove(position);
                }
                SendBufferOp::Cancel => return,
                SendBufferOp::Continue => position += 1,
            }
            index += 1;
        }
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().clear();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use crate::packet::Descriptor;

    use super::*;

    fn reliable_packet(sequence: u16) -> Packet {
        Packet {
            descriptor: Descriptor::RELIABLE,
            sequence,
            ..Packet::default()
        }
    }

    fn filled_buffer(sequences: &[u16]) -> SendBuffer {
        let buffer = SendBuffer::new();
        for &sequence in sequences {
            buffer.add(reliable_packet(sequence), false);
        }
        buffer
    }

    #[test]
    fn test_retrieve_removes_entry() {
        let buffer = filled_buffer(&[1, 2, 3]);

        let sent = buffer.retrieve(2).unwrap();
        assert_eq!(sent.packet.sequence, 2);
        assert_eq!(buffer.len(), 2);

        assert!(buffer.retrieve(2).is_none());
    }

    #[rstest]
    #[case::empty(&[], 7)]
    #[case::single_other(&[1], 7)]
    #[case::many_other(&[1, 2, 3, 4], 7)]
    fn test_retrieve_missing(#[case] sequences: &[u16], #[case] wanted: u16) {
        let buffer = filled_buffer(sequences);
        assert!(buffer.retrieve(wanted).is_none());
    }

    #[test]
    fn test_iterate_insertion_order() {
        let buffer = filled_buffer(&[5, 9, 2]);

        let mut seen = Vec::new();
        buffer.iterate(|index, sent| {
            seen.push((index, sent.packet.sequence));
            SendBufferOp::Continue
        });

        assert_eq!(seen, vec![(0, 5), (1, 9), (2, 2)]);
    }

    #[test]
    fn test_iterate_delete() {
        let buffer = filled_buffer(&[1, 2, 3, 4]);

        buffer.iterate(|_, sent| {
            if sent.packet.sequence % 2 == 0 {
                SendBufferOp::Delete
            }
            else {
                SendBufferOp::Continue
            }
        });

        let mut remaining = Vec::new();
        buffer.iterate(|_, sent| {
            remaining.push(sent.packet.sequence);
            SendBufferOp::Continue
        });
        assert_eq!(remaining, vec![1, 3]);
    }

    #[test]
    fn test_iterate_cancel_bounds_the_sweep() {
        let buffer = filled_buffer(&[1, 2, 3, 4, 5]);

        let mut visited = 0;
        buffer.iterate(|index, _| {
            if index >= 2 {
                return SendBufferOp::Cancel;
            }
            visited += 1;
            SendBufferOp::Continue
        });

        assert_eq!(visited, 2);
        assert_eq!(buffer.len(), 5);
    }

    #[test]
    fn test_no_rtt_flag_is_kept() {
        let buffer = SendBuffer::new();
        buffer.add(reliable_packet(1), true);
        buffer.add(reliable_packet(2), false);

        assert!(buffer.retrieve(1).unwrap().no_rtt);
        assert!(!buffer.retrieve(2).unwrap().no_rtt);
    }

    #[test]
    fn test_reset() {
        let buffer = filled_buffer(&[1, 2]);
        buffer.reset();
        assert_eq!(buffer.len(), 0);
        assert!(buffer.retrieve(1).is_none());
    }
}
