use std::sync::Mutex;

/// Fixed ring recording which sequence numbers have been seen, over the wrapping u16
/// sequence space. A slot is authoritative only while the stored sequence matches the
/// queried one; anything else reads as "not seen". This distinguishes an empty slot from
/// a flagged one without ever clearing slots on the hot path.
pub(crate) struct SequenceBuffer {
    size: u16,
    inner: Mutex<Inner>,
}

struct Inner {
    sequences: Vec<u16>,
    states: Vec<bool>,
}

impl SequenceBuffer {
    pub fn new(size: u16) -> SequenceBuffer {
        SequenceBuffer {
            size,
            inner: Mutex::new(Inner {
                sequences: vec![0; size as usize],
                states: vec![false; size as usize],
            }),
        }
    }

    pub fn get(&self, sequence: u16) -> bool {
        let inner = self.inner.lock().unwrap();
        let slot = (sequence % self.size) as usize;

        if inner.sequences[slot] != sequence {
            return false;
        }

        inner.states[slot]
    }

    pub fn set(&self, sequence: u16, value: bool) {
        let mut inner = self.inner.lock().unwrap();
        let slot = (sequence % self.size) as usize;

        inner.sequences[slot] = sequence;
        inner.states[slot] = value;
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.sequences.fill(0);
        inner.states.fill(false);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::zero(0)]
    #[case::small(17)]
    #[case::wrapped(40017)]
    #[case::max(65535)]
    fn test_set_then_get(#[case] sequence: u16) {
        let buffer = SequenceBuffer::new(200);

        assert!(!buffer.get(sequence));
        buffer.set(sequence, true);
        assert!(buffer.get(sequence));

        buffer.set(sequence, false);
        assert!(!buffer.get(sequence));
    }

    #[test]
    fn test_slot_collision_reads_as_absent() {
        let buffer = SequenceBuffer::new(200);

        // 17 and 217 share a slot; flagging one says nothing about the other
        buffer.set(17, true);
        assert!(buffer.get(17));
        assert!(!buffer.get(217));

        // overwriting the slot forgets the previous occupant
        buffer.set(217, true);
        assert!(buffer.get(217));
        assert!(!buffer.get(17));
    }

    #[test]
    fn test_get_only_after_set() {
        let buffer = SequenceBuffer::new(200);

        for sequence in 0..1000u16 {
            assert!(!buffer.get(sequence));
        }
    }

    #[test]
    fn test_reset() {
        let buffer = SequenceBuffer::new(200);

        buffer.set(3, true);
        buffer.set(77, true);
        buffer.reset();

        assert!(!buffer.get(3));
        assert!(!buffer.get(77));
    }
}
