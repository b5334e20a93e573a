use std::collections::VecDeque;
use std::sync::Mutex;

use crate::packet::Packet;
use crate::util;

/// Bounded buffer of reliable-ordered packets waiting for their predecessors, kept
/// sorted ascending by wrapping order number. `next` is the order number awaited for
/// consecutive delivery.
///
/// When the chain is full, insertion drops the lowest buffered packet: an overfull chain
/// means the stream has wedged, and the oldest stragglers are the least likely to still
/// be useful. The chain-skip timeout complements this by advancing `next` past a lost
/// predecessor.
pub(crate) struct OrderedChain {
    max_length: u8,
    inner: Mutex<Inner>,
}

struct Inner {
    next: u8,
    links: VecDeque<Packet>,
}

impl OrderedChain {
    pub fn new(max_length: u8) -> OrderedChain {
        OrderedChain {
            max_length,
            inner: Mutex::new(Inner {
                next: 0,
                links: VecDeque::new(),
            }),
        }
    }

    /// Inserts the packet after the last link whose order is wrapping-less than the
    /// packet's, keeping the chain sorted.
    pub fn chain(&self, packet: Packet) {
        let mut inner = self.inner.lock().unwrap();

        let position = inner
            .links
            .iter()
            .take_while(|link| util::greater_than_order(packet.order, link.order))
            .count();
        inner.links.insert(position, packet);

        if inner.links.len() > self.max_length as usize {
            inner.links.pop_front();
        }
    }

    /// Detaches and returns the prefix whose orders are exactly `next, next+1, …`,
    /// advancing `next` past it. Empty when the awaited order has not arrived.
    pub fn pop_consecutive(&self) -> Vec<Packet> {
        let mut inner = self.inner.lock().unwrap();

        let mut popped = Vec::new();
        while let Some(link) = inner.links.front() {
            if link.order != inner.next {
                break;
            }
            inner.next = inner.next.wrapping_add(1);
            popped.push(inner.links.pop_front().expect("front link exists"));
        }

        popped
    }

    /// Advances `next` to the earliest queued order number, breaking a wedged stream.
    pub fn skip(&self) {
        let mut inner = self.inner.lock().unwrap();

        if let Some(link) = inner.links.front() {
            inner.next = link.order;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.next = 0;
        inner.links.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().links.len()
    }

    #[cfg(test)]
    fn next(&self) -> u8 {
        self.inner.lock().unwrap().next
    }

    #[cfg(test)]
    fn orders(&self) -> Vec<u8> {
        self.inner
            .lock()
            .unwrap()
            .links
            .iter()
            .map(|link| link.order)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    fn ordered_packet(order: u8) -> Packet {
        Packet {
            order,
            ..Packet::default()
        }
    }

    #[test]
    fn test_full_chain_drops_lowest() {
        let chain = OrderedChain::new(6);

        for order in 1..=10u8 {
            chain.chain(ordered_packet(order));
        }

        assert_eq!(chain.len(), 6);
        assert_eq!(chain.orders(), vec![5, 6, 7, 8, 9, 10]);
    }

    #[rstest]
    #[case::already_sorted(&[1, 2, 3], &[1, 2, 3])]
    #[case::reversed(&[3, 2, 1], &[1, 2, 3])]
    #[case::interleaved(&[1, 4, 3, 2, 0], &[0, 1, 2, 3, 4])]
    #[case::around_the_wrap(&[254, 1, 255, 0], &[254, 255, 0, 1])]
    fn test_chain_keeps_wrapping_order(#[case] arrivals: &[u8], #[case] expected: &[u8]) {
        let chain = OrderedChain::new(255);

        for &order in arrivals {
            chain.chain(ordered_packet(order));
        }

        assert_eq!(chain.orders(), expected);
    }

    #[test]
    fn test_pop_consecutive() {
        let chain = OrderedChain::new(10);

        for order in [1, 2, 3, 5, 6] {
            chain.chain(ordered_packet(order));
        }

        // order 0 is still missing
        assert!(chain.pop_consecutive().is_empty());

        chain.chain(ordered_packet(0));
        let popped = chain.pop_consecutive();
        assert_eq!(popped.iter().map(|p| p.order).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.next(), 4);

        // order 4 is still missing
        assert!(chain.pop_consecutive().is_empty());

        chain.chain(ordered_packet(4));
        let popped = chain.pop_consecutive();
        assert_eq!(popped.iter().map(|p| p.order).collect::<Vec<_>>(), vec![4, 5, 6]);
        assert_eq!(chain.len(), 0);
        assert_eq!(chain.next(), 7);
    }

    #[test]
    fn test_pop_consecutive_across_wrap() {
        let chain = OrderedChain::new(10);

        for order in [254, 255, 0, 1] {
            chain.chain(ordered_packet(order));
        }
        chain.skip();

        let popped = chain.pop_consecutive();
        assert_eq!(
            popped.iter().map(|p| p.order).collect::<Vec<_>>(),
            vec![254, 255, 0, 1]
        );
        assert_eq!(chain.next(), 2);
    }

    #[test]
    fn test_skip_advances_to_earliest_queued() {
        let chain = OrderedChain::new(10);

        chain.chain(ordered_packet(7));
        chain.chain(ordered_packet(8));

        assert!(chain.pop_consecutive().is_empty());

        chain.skip();
        let popped = chain.pop_consecutive();
        assert_eq!(popped.iter().map(|p| p.order).collect::<Vec<_>>(), vec![7, 8]);
    }

    #[test]
    fn test_skip_on_empty_chain_is_noop() {
        let chain = OrderedChain::new(10);
        chain.skip();
        assert_eq!(chain.next(), 0);
    }

    #[test]
    fn test_reset() {
        let chain = OrderedChain::new(10);
        chain.chain(ordered_packet(0));
        chain.chain(ordered_packet(1));
        let _ = chain.pop_consecutive();

        chain.reset();
        assert_eq!(chain.len(), 0);
        assert_eq!(chain.next(), 0);
    }
}
