/// Cyclic sequence number space `0..modulus`. The modulus is the window size, and the largest
///  sequence number (`max_seq`) is `modulus - 1`.
///
/// Since a receiver acknowledges the sequence number *preceding* the one it expects, at most
///  `max_seq` frames can be outstanding at any time: with `modulus` outstanding frames, a
///  cumulative ack for all of them would be indistinguishable from an ack for none of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeqSpace {
    modulus: u32,
}

impl SeqSpace {
    pub fn new(modulus: u32) -> SeqSpace {
        assert!(modulus >= 2, "a sequence space needs at least two numbers");
        SeqSpace { modulus }
    }

    pub fn modulus(&self) -> u32 {
        self.modulus
    }

    pub fn max_seq(&self) -> u32 {
        self.modulus - 1
    }

    pub fn next(&self, value: u32) -> u32 {
        debug_assert!(value < self.modulus);
        if value == self.max_seq() { 0 } else { value + 1 }
    }

    pub fn prev(&self, value: u32) -> u32 {
        debug_assert!(value < self.modulus);
        if value == 0 { self.max_seq() } else { value - 1 }
    }

    /// true iff `b` lies in the half-open cyclic interval `[a, c)`
    pub fn between(&self, a: u32, b: u32, c: u32) -> bool {
        debug_assert!(a < self.modulus && b < self.modulus && c < self.modulus);
        (a <= b && b < c) || (c < a && a <= b) || (b < c && c < a)
    }
}
