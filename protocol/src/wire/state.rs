//! # Compact Encoding Primitives
//!
//! Every record is encoded in two passes: `preencode` computes the exact
//! length, then `encode_into` writes into a buffer of that capacity. The
//! field types are few:
//!
//! ```text
//! uint     n < 0xfd        -> 1 byte
//!          n <= u16::MAX   -> 0xfd + u16 LE
//!          n <= u32::MAX   -> 0xfe + u32 LE
//!          otherwise       -> 0xff + u64 LE
//! uint32   4 bytes LE
//! fixedN   N raw bytes
//! buffer   uint length + bytes
//! ```
//!
//! Decoding never panics: every read checks the remaining length first and
//! reports [`DecodeError::UnexpectedEnd`] instead. Trailing bytes after a
//! complete record are ignored.

use bytes::{Buf, BufMut};
use thiserror::Error;

/// Malformed wire bytes.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEnd,

    #[error("unknown version {0}")]
    UnknownVersion(u64),

    #[error("unknown response status {0}")]
    UnknownStatus(u64),

    #[error("invalid field length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("varint does not fit the target type")]
    VarintOverflow,
}

/// A record with a fixed binary layout.
pub trait Codec: Sized {
    /// Exact number of bytes [`Codec::encode_into`] will write.
    fn preencode(&self) -> usize;

    fn encode_into<B: BufMut>(&self, out: &mut B);

    fn decode_from(src: &mut Decoder<'_>) -> Result<Self, DecodeError>;

    /// Encode into a buffer allocated at exactly the preencoded length.
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.preencode());
        self.encode_into(&mut out);
        debug_assert_eq!(out.len(), self.preencode());
        out
    }

    fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        Self::decode_from(&mut Decoder::new(bytes))
    }
}

/// Bounds-checked reader over a byte slice.
pub struct Decoder<'a> {
    buf: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            Err(DecodeError::UnexpectedEnd)
        } else {
            Ok(())
        }
    }

    pub fn uint(&mut self) -> Result<u64, DecodeError> {
        self.need(1)?;
        match self.buf.get_u8() {
            0xfd => {
                self.need(2)?;
                Ok(u64::from(self.buf.get_u16_le()))
            }
            0xfe => {
                self.need(4)?;
                Ok(u64::from(self.buf.get_u32_le()))
            }
            0xff => {
                self.need(8)?;
                Ok(self.buf.get_u64_le())
            }
            n => Ok(u64::from(n)),
        }
    }

    pub fn uint32(&mut self) -> Result<u32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    pub fn fixed<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        self.need(N)?;
        let mut out = [0u8; N];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    pub fn buffer(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = usize::try_from(self.uint()?).map_err(|_| DecodeError::VarintOverflow)?;
        self.need(len)?;
        let mut out = vec![0u8; len];
        self.buf.copy_to_slice(&mut out);
        Ok(out)
    }

    /// A length-prefixed buffer that must be exactly `N` bytes.
    pub fn sized_buffer<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let bytes = self.buffer()?;
        <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| DecodeError::InvalidLength {
            expected: N,
            got: bytes.len(),
        })
    }
}

pub fn uint_len(n: u64) -> usize {
    if n < 0xfd {
        1
    } else if n <= u64::from(u16::MAX) {
        3
    } else if n <= u64::from(u32::MAX) {
        5
    } else {
        9
    }
}

pub fn put_uint<B: BufMut>(out: &mut B, n: u64) {
    if n < 0xfd {
        out.put_u8(n as u8);
    } else if n <= u64::from(u16::MAX) {
        out.put_u8(0xfd);
        out.put_u16_le(n as u16);
    } else if n <= u64::from(u32::MAX) {
        out.put_u8(0xfe);
        out.put_u32_le(n as u32);
    } else {
        out.put_u8(0xff);
        out.put_u64_le(n);
    }
}

pub fn buffer_len(bytes: &[u8]) -> usize {
    uint_len(bytes.len() as u64) + bytes.len()
}

pub fn put_buffer<B: BufMut>(out: &mut B, bytes: &[u8]) {
    put_uint(out, bytes.len() as u64);
    out.put_slice(bytes);
}
