/// MSB-first bit reader over unstuffed entropy-coded data.
///
/// Reading past the end of the data yields zero bits, mirroring how decoders treat a truncated
/// restart interval. [`BitReader::overrun`] reports whether that happened.
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Number of bytes loaded into `acc`, including virtual zero bytes past the end.
    loaded: usize,
    acc: u64,
    left: u32, // 0-64 bits left in `acc`
}

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        let mut this = Self {
            data,
            loaded: 0,
            acc: 0,
            left: 0,
        };
        this.refill();
        this
    }

    /// Ensures that there are at least 57 readable bits in the buffer.
    fn refill(&mut self) {
        while self.left <= 56 {
            let byte = self.data.get(self.loaded).copied().unwrap_or(0);
            self.acc |= u64::from(byte) << (56 - self.left);
            self.left += 8;
            self.loaded += 1;
        }
    }

    pub fn consume(&mut self, n: u32) {
        debug_assert!(n <= 32 && n <= self.left);
        self.acc = self.acc.checked_shl(n).unwrap_or(0);
        self.left -= n;
        self.refill();
    }

    /// Peeks at the next `n` bits.
    pub fn peek(&self, n: u32) -> u32 {
        debug_assert!(n > 0 && n <= 32 && n <= self.left);
        (self.acc >> (64 - n)) as u32
    }

    pub fn read_bits(&mut self, n: u32) -> u32 {
        if n == 0 {
            return 0;
        }
        let bits = self.peek(n);
        self.consume(n);
        bits
    }

    pub fn read_bit(&mut self) -> bool {
        self.read_bits(1) != 0
    }

    /// Reads an `s`-bit magnitude and sign-extends it as described in F.2.2.1 (`EXTEND`).
    pub fn receive_extend(&mut self, s: u8) -> i32 {
        if s == 0 {
            return 0;
        }
        let value = self.read_bits(s.into()) as i32;
        if value < 1 << (s - 1) {
            value - (1 << s) + 1
        } else {
            value
        }
    }

    /// Returns whether more bits were consumed than the data contains.
    pub fn overrun(&self) -> bool {
        let consumed = self.loaded * 8 - self.left as usize;
        consumed > self.data.len() * 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitstream() {
        let mut bitstream = BitReader::new(&[0b01110011, 0b11110000, 0b00000001, 0b01010101]);
        assert_eq!(bitstream.peek(2), 0b01);
        assert_eq!(bitstream.peek(4), 0b0111);
        assert_eq!(bitstream.peek(8), 0b01110011);
        bitstream.consume(2);
        assert_eq!(bitstream.peek(2), 0b11);
        assert_eq!(bitstream.peek(6), 0b110011);
        assert_eq!(bitstream.peek(22), 0b110011_11110000_00000001);
        bitstream.consume(22);
        assert_eq!(bitstream.peek(8), 0b01010101);
        assert_eq!(bitstream.peek(16), 0b01010101_00000000); // past the end
        assert!(!bitstream.overrun());
        bitstream.consume(8);
        assert!(!bitstream.overrun());
        assert!(!bitstream.read_bit());
        assert!(bitstream.overrun());
    }

    #[test]
    fn extend() {
        // 3-bit magnitudes: 000..011 are negative, 100..111 positive.
        let mut bitstream = BitReader::new(&[0b000_011_10, 0b0_111_0000]);
        assert_eq!(bitstream.receive_extend(3), -7);
        assert_eq!(bitstream.receive_extend(3), -4);
        assert_eq!(bitstream.receive_extend(3), 4);
        assert_eq!(bitstream.receive_extend(3), 7);
        assert_eq!(bitstream.receive_extend(0), 0);
        assert_eq!(bitstream.receive_extend(1), -1);
    }
}
