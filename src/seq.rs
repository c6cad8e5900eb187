use std::fmt::{Display, Formatter};

/// 24-bit wrapping sequence number, used for datagram sequencing, reliable message indices
///  and ordering/sequencing indices alike.
///
/// Comparisons are wrap-aware: a number is 'newer' than another iff the signed difference,
///  computed modulo 2^24, is positive. This makes the ordering meaningful as long as two
///  compared numbers are less than half the number space (2^23) apart, which the bounded
///  send/receive windows guarantee.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    const MASK: u32 = 0x00ff_ffff;
    const HALF: u32 = 0x0080_0000;

    pub fn from_raw(value: u32) -> SequenceNumber {
        SequenceNumber(value & Self::MASK)
    }

    pub fn to_raw(self) -> u32 {
        self.0
    }

    pub fn next(self) -> SequenceNumber {
        SequenceNumber((self.0 + 1) & Self::MASK)
    }

    /// post-increment: returns the current value and advances self
    pub fn fetch_next(&mut self) -> SequenceNumber {
        let result = *self;
        *self = self.next();
        result
    }

    pub fn plus(self, offset: u32) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(offset) & Self::MASK)
    }

    /// number of increments to get from `other` to `self`, modulo the wrap
    pub fn distance_after(self, other: SequenceNumber) -> u32 {
        self.0.wrapping_sub(other.0) & Self::MASK
    }

    pub fn is_newer_than(self, other: SequenceNumber) -> bool {
        let diff = self.distance_after(other);
        diff != 0 && diff < Self::HALF
    }

    /// iterates from `self` (inclusive) up to `end` (exclusive) in wrap-aware increments
    pub fn until(self, end: SequenceNumber) -> impl Iterator<Item = SequenceNumber> {
        (0..end.distance_after(self))
            .map(move |offset| self.plus(offset))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    #[rstest]
    #[case::zero(0, 0)]
    #[case::in_range(12345, 12345)]
    #[case::max(0x00ff_ffff, 0x00ff_ffff)]
    #[case::truncated(0x0100_0001, 1)]
    fn test_from_raw(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(SequenceNumber::from_raw(raw).to_raw(), expected);
    }

    #[rstest]
    #[case::regular(5, 6)]
    #[case::wrap(0x00ff_ffff, 0)]
    fn test_next(#[case] raw: u32, #[case] expected: u32) {
        assert_eq!(SequenceNumber::from_raw(raw).next().to_raw(), expected);
    }

    #[rstest]
    #[case::equal(7, 7, false)]
    #[case::newer(8, 7, true)]
    #[case::older(7, 8, false)]
    #[case::newer_across_wrap(1, 0x00ff_fffe, true)]
    #[case::older_across_wrap(0x00ff_fffe, 1, false)]
    #[case::half_space(0x0080_0000, 0, false)]
    #[case::just_below_half_space(0x007f_ffff, 0, true)]
    fn test_is_newer_than(#[case] a: u32, #[case] b: u32, #[case] expected: bool) {
        assert_eq!(SequenceNumber::from_raw(a).is_newer_than(SequenceNumber::from_raw(b)), expected);
    }

    #[rstest]
    #[case::same(3, 3, 0)]
    #[case::regular(7, 3, 4)]
    #[case::across_wrap(2, 0x00ff_fffe, 4)]
    fn test_distance_after(#[case] a: u32, #[case] b: u32, #[case] expected: u32) {
        assert_eq!(SequenceNumber::from_raw(a).distance_after(SequenceNumber::from_raw(b)), expected);
    }

    #[rstest]
    #[case::empty(5, 5, vec![])]
    #[case::regular(5, 8, vec![5, 6, 7])]
    #[case::across_wrap(0x00ff_fffe, 1, vec![0x00ff_fffe, 0x00ff_ffff, 0])]
    fn test_until(#[case] from: u32, #[case] to: u32, #[case] expected: Vec<u32>) {
        let actual = SequenceNumber::from_raw(from)
            .until(SequenceNumber::from_raw(to))
            .map(|s| s.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }
}
