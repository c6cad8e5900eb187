use anyhow::bail;
use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::seq::SequenceNumber;

/// Receive-side delivery-order state for one ordering channel.
///
/// Ordered messages are buffered until contiguous and released in index order -
///  completeness over latency. Sequenced messages are delivered immediately but only
///  if strictly newer (wrap-aware) than the newest seen so far, older ones are stale
///  and dropped silently - freshness over completeness. Sequenced freshness is scoped
///  to the ordered position a message rides on: the send side resets its sequenced
///  counter on every ordered send, so the receive side compares the ordered index
///  first and the sequenced index only within one ordered position.
pub struct OrderingChannelIn {
    next_ordered: SequenceNumber,
    /// (ordered position, sequenced index) of the freshest sequenced message seen
    highest_sequenced: Option<(SequenceNumber, SequenceNumber)>,
    /// ordered messages that arrived ahead of a gap, keyed by raw index
    buffered: FxHashMap<u32, Bytes>,
    window_size: usize,
}

impl OrderingChannelIn {
    pub fn new(window_size: usize) -> OrderingChannelIn {
        OrderingChannelIn {
            next_ordered: SequenceNumber::ZERO,
            highest_sequenced: None,
            buffered: FxHashMap::default(),
            window_size,
        }
    }

    /// Handles an ordered message, appending everything that became deliverable to
    ///  `out` in index order. An index further ahead of the delivery cursor than the
    ///  window allows is an error - buffering it would let a peer that withholds one
    ///  message grow our state without limit.
    pub fn on_ordered(&mut self, index: SequenceNumber, payload: Bytes, out: &mut Vec<Bytes>) -> anyhow::Result<()> {
        if index == self.next_ordered {
            out.push(payload);
            self.next_ordered = self.next_ordered.next();
            // release any contiguous run that was waiting behind the gap
            while let Some(buffered) = self.buffered.remove(&self.next_ordered.to_raw()) {
                out.push(buffered);
                self.next_ordered = self.next_ordered.next();
            }
            return Ok(());
        }

        if !index.is_newer_than(self.next_ordered) {
            // behind the delivery cursor: a duplicate of something already released
            return Ok(());
        }

        if index.distance_after(self.next_ordered) as usize >= self.window_size {
            bail!("ordered message {} is outside the {}-message window after {}",
                index, self.window_size, self.next_ordered);
        }

        self.buffered.insert(index.to_raw(), payload);
        Ok(())
    }

    /// Handles a sequenced message, returning it if it is fresh enough to deliver.
    ///  A later ordered position always wins; within one ordered position the
    ///  sequenced index decides.
    pub fn on_sequenced(
        &mut self,
        sequenced_index: SequenceNumber,
        ordered_index: SequenceNumber,
        payload: Bytes,
    ) -> Option<Bytes> {
        let fresh = match self.highest_sequenced {
            None => true,
            Some((highest_ordered, highest_sequenced)) =>
                ordered_index.is_newer_than(highest_ordered)
                    || (ordered_index == highest_ordered
                        && sequenced_index.is_newer_than(highest_sequenced)),
        };
        if fresh {
            self.highest_sequenced = Some((ordered_index, sequenced_index));
            Some(payload)
        } else {
            None
        }
    }

    pub fn num_buffered(&self) -> usize {
        self.buffered.len()
    }
}

/// Send-side index assignment for one ordering channel.
///
/// Sequenced messages share the ordered index space: they carry the current ordered
///  index unchanged, and sending an ordered message resets the sequenced counter so
///  sequenced freshness is scoped to the ordered position it rides on.
pub struct OrderingChannelOut {
    next_ordered: SequenceNumber,
    next_sequenced: SequenceNumber,
}

impl OrderingChannelOut {
    pub fn new() -> OrderingChannelOut {
        OrderingChannelOut {
            next_ordered: SequenceNumber::ZERO,
            next_sequenced: SequenceNumber::ZERO,
        }
    }

    /// returns (sequenced index, ordered index) for an ordered send
    pub fn next_ordered(&mut self) -> (SequenceNumber, SequenceNumber) {
        let ordered = self.next_ordered.fetch_next();
        self.next_sequenced = SequenceNumber::ZERO;
        (SequenceNumber::ZERO, ordered)
    }

    /// returns (sequenced index, ordered index) for a sequenced send
    pub fn next_sequenced(&mut self) -> (SequenceNumber, SequenceNumber) {
        (self.next_sequenced.fetch_next(), self.next_ordered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn seq(raw: u32) -> SequenceNumber {
        SequenceNumber::from_raw(raw)
    }

    fn payload(tag: u8) -> Bytes {
        Bytes::from(vec![tag])
    }

    #[rstest]
    #[case::in_order(vec![0, 1, 2, 3], vec![0, 1, 2, 3])]
    #[case::gap_then_fill(vec![2, 0, 1, 3], vec![0, 1, 2, 3])]
    #[case::reversed(vec![3, 2, 1, 0], vec![0, 1, 2, 3])]
    #[case::duplicate_dropped(vec![0, 0, 1], vec![0, 1])]
    fn test_ordered_release(#[case] arrivals: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut channel = OrderingChannelIn::new(512);
        let mut out = Vec::new();
        for index in arrivals {
            channel.on_ordered(seq(index), payload(index as u8), &mut out).unwrap();
        }
        let released = out.iter().map(|b| b[0] as u32).collect::<Vec<_>>();
        assert_eq!(released, expected);
        assert_eq!(channel.num_buffered(), 0);
    }

    #[test]
    fn test_ordered_buffers_until_gap_fills() {
        let mut channel = OrderingChannelIn::new(512);
        let mut out = Vec::new();
        channel.on_ordered(seq(1), payload(1), &mut out).unwrap();
        channel.on_ordered(seq(2), payload(2), &mut out).unwrap();
        assert!(out.is_empty());
        assert_eq!(channel.num_buffered(), 2);

        channel.on_ordered(seq(0), payload(0), &mut out).unwrap();
        let released = out.iter().map(|b| b[0]).collect::<Vec<_>>();
        assert_eq!(released, vec![0, 1, 2]);
    }

    #[test]
    fn test_ordered_outside_window_is_an_error() {
        let mut channel = OrderingChannelIn::new(4);
        let mut out = Vec::new();
        assert!(channel.on_ordered(seq(100), payload(9), &mut out).is_err());
        assert!(out.is_empty());
        assert_eq!(channel.num_buffered(), 0);
    }

    #[test]
    fn test_ordered_handles_wrap() {
        let mut channel = OrderingChannelIn::new(512);
        channel.next_ordered = seq(0x00ff_ffff);

        let mut out = Vec::new();
        channel.on_ordered(seq(0), payload(2), &mut out).unwrap();
        assert!(out.is_empty());
        channel.on_ordered(seq(0x00ff_ffff), payload(1), &mut out).unwrap();
        let released = out.iter().map(|b| b[0]).collect::<Vec<_>>();
        assert_eq!(released, vec![1, 2]);
    }

    #[rstest]
    #[case::fresh_only(vec![2, 0, 1, 3], vec![2, 3])]
    #[case::monotone(vec![0, 1, 2], vec![0, 1, 2])]
    #[case::duplicate_stale(vec![1, 1], vec![1])]
    #[case::first_zero_delivered(vec![0], vec![0])]
    fn test_sequenced_delivery(#[case] arrivals: Vec<u32>, #[case] expected: Vec<u32>) {
        let mut channel = OrderingChannelIn::new(512);
        let mut delivered = Vec::new();
        for index in arrivals {
            if let Some(b) = channel.on_sequenced(seq(index), seq(0), payload(index as u8)) {
                delivered.push(b[0] as u32);
            }
        }
        assert_eq!(delivered, expected);
    }

    #[test]
    fn test_sequenced_wrap_is_newer() {
        let mut channel = OrderingChannelIn::new(512);
        assert!(channel.on_sequenced(seq(0x00ff_fffe), seq(0), payload(1)).is_some());
        // 1 is "newer" than 0xfffffe across the wrap
        assert!(channel.on_sequenced(seq(1), seq(0), payload(2)).is_some());
        assert!(channel.on_sequenced(seq(0x00ff_ffff), seq(0), payload(3)).is_none());
    }

    #[test]
    fn test_sequenced_fresh_again_after_ordered_send() {
        let mut sender = OrderingChannelOut::new();
        let mut receiver = OrderingChannelIn::new(512);

        for tag in 0..5u8 {
            let (s, o) = sender.next_sequenced();
            assert!(receiver.on_sequenced(s, o, payload(tag)).is_some());
        }

        // an ordered send advances the position and resets the sequenced counter;
        //  the next sequenced message starts over at index 0 but is still the
        //  newest on the channel
        sender.next_ordered();
        let (s, o) = sender.next_sequenced();
        assert_eq!(s, seq(0));
        assert!(receiver.on_sequenced(s, o, payload(9)).is_some());
    }

    #[test]
    fn test_out_indices() {
        let mut out = OrderingChannelOut::new();
        assert_eq!(out.next_ordered(), (seq(0), seq(0)));
        assert_eq!(out.next_ordered(), (seq(0), seq(1)));
        // sequenced rides on the current ordered position
        assert_eq!(out.next_sequenced(), (seq(0), seq(2)));
        assert_eq!(out.next_sequenced(), (seq(1), seq(2)));
        // an ordered send resets the sequenced counter
        assert_eq!(out.next_ordered(), (seq(0), seq(2)));
        assert_eq!(out.next_sequenced(), (seq(0), seq(3)));
    }
}
