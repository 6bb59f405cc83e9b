use core::fmt;

use crate::{
    bits::BitReader,
    error::{Error, Result},
};

/// Codes of up to this many bits are resolved with a single table lookup.
const LOOKUP_BITS: u8 = 8;

pub struct TableData {
    codes: Vec<(u16, LookupResult)>,
}

impl TableData {
    pub fn build(num_codes_per_length: &[u8; 16], codes: &[u8]) -> Result<Self> {
        // First, generate all huffman codes from the inputs.
        let mut out = Vec::new();

        // The following is similar in function to the flowcharts in Annex C
        // (`Generate_size_table` and `Generate_code_table`)
        let mut next_code: u32 = 0;
        let mut code_iter = codes.iter();
        for (code_length, &code_count) in num_codes_per_length.iter().enumerate() {
            let code_length = (code_length + 1) as u8; // 1-based

            next_code <<= 1;

            for _ in 0..code_count {
                let Some(&value) = code_iter.next() else {
                    return Err(Error::malformed("huffman table has fewer values than codes"));
                };
                // The all-ones code of each length is reserved.
                if next_code + 1 >= 1 << code_length {
                    return Err(Error::malformed(format!(
                        "huffman table overflows the {code_length}-bit code space"
                    )));
                }
                out.push((next_code as u16, LookupResult::new(code_length, value)));
                next_code += 1;
            }
        }

        Ok(Self { codes: out })
    }
}

impl fmt::Debug for TableData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for &(code, lookup) in &self.codes {
            let bits = lookup.bits;
            let value = lookup.value;
            writeln!(
                f,
                "{bits} {:01$b} -> {2:02x}",
                code,
                usize::from(bits),
                value,
            )?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Default)]
struct LookupResult {
    /// Length of the huffman code in bits (number of bits that need to be consumed from the input).
    /// 0 marks an empty lookup table slot.
    bits: u8,
    /// Decoded value. Meaning depends on table class (AC/DC).
    value: u8,
}

impl LookupResult {
    fn new(bits: u8, value: u8) -> Self {
        Self { bits, value }
    }
}

/// A Huffman table prepared for decoding entropy-coded data.
///
/// Short codes are resolved through a 256-entry prefix table, longer ones by comparing against the
/// per-length code ranges.
pub struct HuffmanDecoder {
    lookup: Box<[LookupResult; 1 << LOOKUP_BITS]>,
    /// Largest code of each length (index = length), or -1 if there is none.
    max_code: [i32; 17],
    /// Smallest code of each length.
    min_code: [u16; 17],
    /// Index into `values` of the first value with each code length.
    value_offset: [usize; 17],
    values: Vec<u8>,
}

impl HuffmanDecoder {
    pub fn new(data: &TableData) -> Self {
        let mut lookup = Box::new([LookupResult::default(); 1 << LOOKUP_BITS]);
        let mut max_code = [-1; 17];
        let mut min_code = [0; 17];
        let mut value_offset = [0; 17];
        let mut values = Vec::with_capacity(data.codes.len());

        for (index, &(code, result)) in data.codes.iter().enumerate() {
            let len = usize::from(result.bits);
            if max_code[len] < 0 {
                min_code[len] = code;
                value_offset[len] = index;
            }
            max_code[len] = i32::from(code);
            values.push(result.value);

            if result.bits <= LOOKUP_BITS {
                // Fill every slot whose prefix is this code.
                let shift = LOOKUP_BITS - result.bits;
                let first = usize::from(code) << shift;
                for slot in &mut lookup[first..first + (1 << shift)] {
                    *slot = result;
                }
            }
        }

        Self {
            lookup,
            max_code,
            min_code,
            value_offset,
            values,
        }
    }

    pub fn decode(&self, reader: &mut BitReader<'_>) -> Result<u8> {
        let peek = reader.peek(16);
        let result = self.lookup[(peek >> (16 - LOOKUP_BITS)) as usize];
        if result.bits != 0 {
            reader.consume(result.bits.into());
            return Ok(result.value);
        }

        for len in usize::from(LOOKUP_BITS) + 1..=16 {
            let code = (peek >> (16 - len)) as i32;
            if code <= self.max_code[len] {
                reader.consume(len as u32);
                let index = self.value_offset[len] + (code - i32::from(self.min_code[len])) as usize;
                return Ok(self.values[index]);
            }
        }

        Err(Error::codec("corrupt entropy-coded data: invalid huffman code"))
    }
}

/// The example tables from Annex K.3 of the JPEG standard.
///
/// Motion-JPEG streams routinely omit their DHT segments and rely on decoders supplying these.
pub mod standard {
    pub const DC_LUMINANCE_BITS: [u8; 16] = [0, 1, 5, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0];
    pub const DC_LUMINANCE_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

    pub const DC_CHROMINANCE_BITS: [u8; 16] = [0, 3, 1, 1, 1, 1, 1, 1, 1, 1, 1, 0, 0, 0, 0, 0];
    pub const DC_CHROMINANCE_VALUES: [u8; 12] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

    pub const AC_LUMINANCE_BITS: [u8; 16] = [0, 2, 1, 3, 3, 2, 4, 3, 5, 5, 4, 4, 0, 0, 1, 0x7d];
    pub const AC_LUMINANCE_VALUES: [u8; 162] = [
        0x01, 0x02, 0x03, 0x00, 0x04, 0x11, 0x05, 0x12, 0x21, 0x31, 0x41, 0x06, 0x13, 0x51, 0x61,
        0x07, 0x22, 0x71, 0x14, 0x32, 0x81, 0x91, 0xa1, 0x08, 0x23, 0x42, 0xb1, 0xc1, 0x15, 0x52,
        0xd1, 0xf0, 0x24, 0x33, 0x62, 0x72, 0x82, 0x09, 0x0a, 0x16, 0x17, 0x18, 0x19, 0x1a, 0x25,
        0x26, 0x27, 0x28, 0x29, 0x2a, 0x34, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44, 0x45,
        0x46, 0x47, 0x48, 0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63, 0x64,
        0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a, 0x83,
        0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97, 0x98, 0x99,
        0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4, 0xb5, 0xb6,
        0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca, 0xd2, 0xd3,
        0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe1, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7, 0xe8,
        0xe9, 0xea, 0xf1, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
    ];

    pub const AC_CHROMINANCE_BITS: [u8; 16] = [0, 2, 1, 2, 4, 4, 3, 4, 7, 5, 4, 4, 0, 1, 2, 0x77];
    pub const AC_CHROMINANCE_VALUES: [u8; 162] = [
        0x00, 0x01, 0x02, 0x03, 0x11, 0x04, 0x05, 0x21, 0x31, 0x06, 0x12, 0x41, 0x51, 0x07, 0x61,
        0x71, 0x13, 0x22, 0x32, 0x81, 0x08, 0x14, 0x42, 0x91, 0xa1, 0xb1, 0xc1, 0x09, 0x23, 0x33,
        0x52, 0xf0, 0x15, 0x62, 0x72, 0xd1, 0x0a, 0x16, 0x24, 0x34, 0xe1, 0x25, 0xf1, 0x17, 0x18,
        0x19, 0x1a, 0x26, 0x27, 0x28, 0x29, 0x2a, 0x35, 0x36, 0x37, 0x38, 0x39, 0x3a, 0x43, 0x44,
        0x45, 0x46, 0x47, 0x48, 0x49, 0x4a, 0x53, 0x54, 0x55, 0x56, 0x57, 0x58, 0x59, 0x5a, 0x63,
        0x64, 0x65, 0x66, 0x67, 0x68, 0x69, 0x6a, 0x73, 0x74, 0x75, 0x76, 0x77, 0x78, 0x79, 0x7a,
        0x82, 0x83, 0x84, 0x85, 0x86, 0x87, 0x88, 0x89, 0x8a, 0x92, 0x93, 0x94, 0x95, 0x96, 0x97,
        0x98, 0x99, 0x9a, 0xa2, 0xa3, 0xa4, 0xa5, 0xa6, 0xa7, 0xa8, 0xa9, 0xaa, 0xb2, 0xb3, 0xb4,
        0xb5, 0xb6, 0xb7, 0xb8, 0xb9, 0xba, 0xc2, 0xc3, 0xc4, 0xc5, 0xc6, 0xc7, 0xc8, 0xc9, 0xca,
        0xd2, 0xd3, 0xd4, 0xd5, 0xd6, 0xd7, 0xd8, 0xd9, 0xda, 0xe2, 0xe3, 0xe4, 0xe5, 0xe6, 0xe7,
        0xe8, 0xe9, 0xea, 0xf2, 0xf3, 0xf4, 0xf5, 0xf6, 0xf7, 0xf8, 0xf9, 0xfa,
    ];
}
