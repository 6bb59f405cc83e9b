//! Scan Data preprocessing.
//!
//! Before a scan is entropy-decoded, its raw data is split into restart intervals:
//!
//! - `RST` markers are located and removed; each one starts a new interval.
//! - `0xFF 0x00` byte stuffing sequences are replaced with `0xFF`.
//!
//! Each interval can then be decoded with a fresh [`BitReader`][crate::bits::BitReader].

use std::ops::Range;

use crate::error::{Error, Result};

pub struct ScanBuffer {
    /// Unstuffed scan data of all restart intervals, back to back.
    bytes: Vec<u8>,
    /// Start offsets of the restart intervals in `bytes`.
    start_positions: Vec<usize>,
}

impl ScanBuffer {
    pub fn new() -> Self {
        Self {
            bytes: Vec::new(),
            start_positions: Vec::new(),
        }
    }

    pub fn process(&mut self, scan_data: &[u8]) -> Result<()> {
        self.bytes.clear();
        self.bytes.reserve(scan_data.len());
        self.start_positions.clear();
        self.start_positions.push(0);

        let mut expected_rst = 0xD0;
        let mut bytes = scan_data.iter().copied();
        loop {
            match bytes.next() {
                Some(0xff) => {
                    // Any number of `0xFF` fill bytes may precede a marker.
                    let mut next = bytes.next();
                    while next == Some(0xff) {
                        next = bytes.next();
                    }
                    match next {
                        Some(0x00) => {
                            // Byte stuffing sequence, push only `0xFF` to the output.
                            self.bytes.push(0xff);
                        }
                        Some(rst @ 0xD0..=0xD7) => self.restart(rst, &mut expected_rst),
                        Some(inv) => return Err(invalid_marker(inv)),
                        None => break,
                    }
                }
                Some(byte) => self.bytes.push(byte),
                None => break,
            }
        }

        Ok(())
    }

    fn restart(&mut self, rst: u8, expected_rst: &mut u8) {
        if rst != *expected_rst {
            log::warn!(
                "found RST{} marker where RST{} was expected",
                rst - 0xD0,
                *expected_rst - 0xD0
            );
        }
        *expected_rst = 0xD0 + ((rst - 0xD0 + 1) & 7);
        self.start_positions.push(self.bytes.len());
    }

    /// Returns the number of restart intervals found in the scan data.
    pub fn interval_count(&self) -> usize {
        self.start_positions.len()
    }

    /// Returns the unstuffed data of restart interval `index`, or an empty slice if the scan data
    /// ended before that interval.
    pub fn interval(&self, index: usize) -> &[u8] {
        match self.range(index) {
            Some(range) => &self.bytes[range],
            None => &[],
        }
    }

    fn range(&self, index: usize) -> Option<Range<usize>> {
        let start = *self.start_positions.get(index)?;
        let end = self
            .start_positions
            .get(index + 1)
            .copied()
            .unwrap_or(self.bytes.len());
        Some(start..end)
    }
}

fn invalid_marker(marker: u8) -> Error {
    Error::codec(format!("invalid marker 0x{:02x} found in scan data", marker))
}
