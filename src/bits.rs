//! Bit-level reading and writing, most significant bit first.
//!
//! [`BitCursor`] pulls fixed-size blocks from any `Read` source and serves
//! arbitrary-width unsigned reads across block boundaries. [`BitWriter`]
//! accumulates fields for a single message and pads it to a whole byte.
use crate::error::BitReadError;
use bitvec::prelude::*;
use std::io::{ErrorKind, Read};

/// Bytes pulled from the source per refill.
pub const BLOCK_SIZE: usize = 4096;

/// Forward-only bit reader over a byte stream.
pub struct BitCursor<R> {
    source: R,
    buffer: Vec<u8>,
    /// Bit index of the next unread bit in `buffer`.
    bit_pos: usize,
    consumed: u64,
}

impl<R: Read> BitCursor<R> {
    pub fn new(source: R) -> Self {
        Self {
            source,
            buffer: Vec::with_capacity(BLOCK_SIZE),
            bit_pos: 0,
            consumed: 0,
        }
    }

    /// Bits pulled from the source but not yet consumed.
    pub fn buffered_bits(&self) -> usize {
        self.buffer.len() * 8 - self.bit_pos
    }

    /// Total bits consumed since the cursor was created.
    pub fn position(&self) -> u64 {
        self.consumed
    }

    /// Read `n_bits` (1..=64) as an unsigned integer.
    ///
    /// On [`BitReadError::EndOfStream`] nothing is consumed, and whatever was
    /// buffered remains visible through [`Self::buffered_bits`].
    pub fn read(&mut self, n_bits: usize) -> Result<u64, BitReadError> {
        if n_bits == 0 {
            return Err(BitReadError::ZeroWidth);
        }
        if n_bits > 64 {
            return Err(BitReadError::TooWide(n_bits));
        }
        while self.buffered_bits() < n_bits {
            if !self.fill()? {
                return Err(BitReadError::EndOfStream);
            }
        }
        let bits = self.buffer.view_bits::<Msb0>();
        let value = bits[self.bit_pos..self.bit_pos + n_bits].load_be::<u64>();
        self.bit_pos += n_bits;
        self.consumed += n_bits as u64;
        Ok(value)
    }

    pub fn read_bit(&mut self) -> Result<bool, BitReadError> {
        Ok(self.read(1)? == 1)
    }

    /// Pull one more block. Returns false once the source is exhausted.
    fn fill(&mut self) -> Result<bool, BitReadError> {
        let spent = self.bit_pos / 8;
        self.buffer.drain(..spent);
        self.bit_pos -= spent * 8;

        let old_len = self.buffer.len();
        self.buffer.resize(old_len + BLOCK_SIZE, 0);
        let n = loop {
            match self.source.read(&mut self.buffer[old_len..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buffer.truncate(old_len);
                    return Err(e.into());
                }
            }
        };
        self.buffer.truncate(old_len + n);
        Ok(n > 0)
    }
}

/// Accumulates one message's fields, MSB first.
#[derive(Debug, Default)]
pub struct BitWriter {
    bits: BitVec<u8, Msb0>,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append the low `width` bits of `value`. Callers guarantee it fits.
    pub fn push(&mut self, value: u64, width: usize) {
        debug_assert!((1..=64).contains(&width));
        debug_assert!(width == 64 || value >> width == 0);
        let start = self.bits.len();
        self.bits.resize(start + width, false);
        self.bits[start..].store_be(value);
    }

    pub fn push_bit(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    /// Zero-pad to the next byte boundary and return the bytes.
    pub fn finish(mut self) -> Vec<u8> {
        let padded = self.bits.len().div_ceil(8) * 8;
        self.bits.resize(padded, false);
        self.bits.into_vec()
    }
}
