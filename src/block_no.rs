use std::fmt::{Display, Formatter};

/// Sequence counter pairing DATA packets with their acks. The first chunk of
///  a transfer is block 1; the counter wraps around to 0 after 65535, so a
///  transfer longer than 65535 chunks keeps going with recycled numbers.
///
/// Block 0 never numbers a chunk - it is reserved for the ack that answers a
///  write request before any data flows.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockNo(u16);

impl Display for BlockNo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl BlockNo {
    pub const ZERO: BlockNo = BlockNo(0);
    pub const FIRST: BlockNo = BlockNo(1);

    pub fn from_raw(value: u16) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> BlockNo {
        BlockNo(self.0.wrapping_add(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, 1)]
    #[case(1, 2)]
    #[case(9999, 10000)]
    #[case(65534, 65535)]
    #[case(65535, 0)]
    fn test_next(#[case] raw: u16, #[case] expected: u16) {
        assert_eq!(BlockNo::from_raw(raw).next(), BlockNo::from_raw(expected));
    }

    #[test]
    fn test_reserved_values() {
        assert_eq!(BlockNo::ZERO.to_raw(), 0);
        assert_eq!(BlockNo::FIRST.to_raw(), 1);
        assert_eq!(BlockNo::ZERO.next(), BlockNo::FIRST);
    }
}
