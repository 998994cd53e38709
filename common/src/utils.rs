//! Common Utilities
//!
//! Byte/bit helpers shared by the protocol codecs

use bytes::{BufMut, Bytes, BytesMut};
use tracing::trace;

/// Convert a byte slice to hex string for debugging
pub fn bytes_to_hex(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

/// MSB-first bit writer over an owned byte buffer
///
/// Fields are appended most significant bit first. The final partial byte
/// is zero padded when the writer is finished.
#[derive(Debug, Default)]
pub struct BitWriter {
    buf: BytesMut,
    /// Byte being assembled
    cur: u8,
    /// Number of bits already placed in `cur`
    used: u8,
}

impl BitWriter {
    /// Create a writer with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            cur: 0,
            used: 0,
        }
    }

    /// Append the `nbits` least significant bits of `value`
    pub fn write_bits(&mut self, value: u32, nbits: u8) {
        debug_assert!(nbits <= 32);
        for i in (0..nbits).rev() {
            let bit = ((value >> i) & 1) as u8;
            self.cur |= bit << (7 - self.used);
            self.used += 1;
            if self.used == 8 {
                self.buf.put_u8(self.cur);
                self.cur = 0;
                self.used = 0;
            }
        }
    }

    /// Append a single flag bit
    pub fn write_bit(&mut self, bit: bool) {
        self.write_bits(bit as u32, 1);
    }

    /// Number of bits written so far
    pub fn bit_len(&self) -> usize {
        self.buf.len() * 8 + self.used as usize
    }

    /// Zero pad to the next byte boundary and return the bytes
    pub fn finish(mut self) -> Bytes {
        if self.used > 0 {
            self.buf.put_u8(self.cur);
        }
        trace!("BitWriter finished with {} bytes", self.buf.len());
        self.buf.freeze()
    }
}

/// MSB-first bounds-checked bit reader
#[derive(Debug, Clone)]
pub struct BitReader<'a> {
    data: &'a [u8],
    /// Absolute bit position
    pos: usize,
}

impl<'a> BitReader<'a> {
    /// Create a reader positioned at the first bit of `data`
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Read `nbits` bits as an unsigned value, `None` if the buffer is too short
    pub fn read_bits(&mut self, nbits: u8) -> Option<u32> {
        debug_assert!(nbits <= 32);
        if self.remaining_bits() < nbits as usize {
            return None;
        }
        let mut value = 0u32;
        for _ in 0..nbits {
            let byte = self.data[self.pos / 8];
            let bit = (byte >> (7 - (self.pos % 8))) & 1;
            value = (value << 1) | bit as u32;
            self.pos += 1;
        }
        Some(value)
    }

    /// Read a single flag bit
    pub fn read_bit(&mut self) -> Option<bool> {
        self.read_bits(1).map(|b| b == 1)
    }

    /// Skip to the next byte boundary
    pub fn align(&mut self) {
        self.pos = (self.pos + 7) / 8 * 8;
    }

    /// Bits not yet consumed
    pub fn remaining_bits(&self) -> usize {
        self.data.len() * 8 - self.pos
    }

    /// Bytes consumed so far, counting a partially read byte as consumed
    pub fn bytes_consumed(&self) -> usize {
        (self.pos + 7) / 8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_to_hex() {
        let data = vec![0x12, 0x34, 0xAB, 0xCD];
        assert_eq!(bytes_to_hex(&data), "12 34 ab cd");
    }

    #[test]
    fn test_bit_writer_msb_first() {
        let mut w = BitWriter::with_capacity(2);
        w.write_bit(true);
        w.write_bits(0b010, 3);
        w.write_bits(0xA, 4);
        w.write_bits(0b1, 1);
        assert_eq!(w.bit_len(), 9);
        let out = w.finish();
        assert_eq!(out.as_ref(), &[0b1010_1010, 0b1000_0000]);
    }

    #[test]
    fn test_bit_reader_bounds() {
        let data = [0xF0, 0x0F];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bits(4), Some(0xF));
        assert_eq!(r.read_bits(8), Some(0x00));
        assert_eq!(r.read_bits(5), None);
        assert_eq!(r.read_bits(4), Some(0xF));
        assert_eq!(r.remaining_bits(), 0);
        assert_eq!(r.read_bit(), None);
    }

    #[test]
    fn test_bit_reader_align() {
        let data = [0x80, 0x7F];
        let mut r = BitReader::new(&data);
        assert_eq!(r.read_bit(), Some(true));
        assert_eq!(r.bytes_consumed(), 1);
        r.align();
        assert_eq!(r.read_bits(8), Some(0x7F));
    }
}
