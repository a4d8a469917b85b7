/// Bounded CBOR codec, decoder inspired by the
/// [minicbor](https://crates.io/crates/minicbor) crate.
///
/// Only the subset the protocol grammar needs is implemented: ints, byte
/// and text strings, definite-length arrays and maps, null, and CBOR
/// sequences (concatenated items without an outer array).
use super::*;

#[derive(Debug, PartialEq)]
pub struct CborDecoder<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CborDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        CborDecoder { buf: bytes, pos: 0 }
    }

    fn read(&mut self) -> Result<u8, Error> {
        if let Some(b) = self.buf.get(self.pos) {
            self.pos += 1;
            Ok(*b)
        } else {
            Err(Error::CborTruncated)
        }
    }

    /// Consume and return *n* bytes starting at the current position.
    fn read_slice(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if let Some(b) = self
            .pos
            .checked_add(n)
            .and_then(|end| self.buf.get(self.pos..end))
        {
            self.pos += n;
            Ok(b)
        } else {
            Err(Error::CborTruncated)
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn finished(&self) -> bool {
        self.pos == self.buf.len()
    }

    pub fn ensure_finished(&self) -> Result<(), Error> {
        if self.finished() {
            Ok(())
        } else {
            Err(Error::CborTrailing)
        }
    }

    pub fn remaining_buffer(&self) -> Result<&'a [u8], Error> {
        if let Some(buffer) = self.buf.get(self.pos..) {
            Ok(buffer)
        } else {
            Err(Error::CborTruncated)
        }
    }

    /// A window of the input, for re-slicing an item that was skipped over.
    pub fn window(&self, start: usize, end: usize) -> Option<&'a [u8]> {
        self.buf.get(start..end)
    }

    /// Get the byte at the current position.
    pub fn current(&self) -> Result<u8, Error> {
        if let Some(b) = self.buf.get(self.pos) {
            Ok(*b)
        } else {
            Err(Error::CborTruncated)
        }
    }

    /// Decode a `u8` value.
    pub fn u8(&mut self) -> Result<u8, Error> {
        let n = self.read()?;
        if (0..=0x17).contains(&n) {
            Ok(n)
        } else if 0x18 == n {
            self.read()
        } else if Self::type_of(n) == CBOR_UINT_1BYTE_START {
            Err(Error::CborMalformed)
        } else {
            Err(Error::CborUnexpectedType)
        }
    }

    /// Decode an `i8` value.
    pub fn i8(&mut self) -> Result<i8, Error> {
        let n = self.read()?;
        if (0..=0x17).contains(&n) {
            Ok(n as i8)
        } else if (0x20..=0x37).contains(&n) {
            Ok(-1 - (n - 0x20) as i8)
        } else if 0x18 == n {
            let v = self.read()?;
            if v <= i8::MAX as u8 {
                Ok(v as i8)
            } else {
                Err(Error::CborMalformed)
            }
        } else if 0x38 == n {
            let v = self.read()?;
            if v <= 0x7e {
                Ok(-1 - v as i8)
            } else {
                Err(Error::CborMalformed)
            }
        } else {
            Err(Error::CborUnexpectedType)
        }
    }

    /// Decode an `i64` from an int of either sign, up to 4 payload bytes.
    pub fn i64(&mut self) -> Result<i64, Error> {
        let b = self.read()?;
        let major = Self::type_of(b);
        if major != CBOR_UINT_1BYTE_START && major != CBOR_NEG_INT_1BYTE_START {
            return Err(Error::CborUnexpectedType);
        }
        let magnitude = match Self::info_of(b) {
            n @ 0..=0x17 => n as u64,
            0x18 => self.read()? as u64,
            0x19 => {
                let hi = self.read()? as u64;
                let lo = self.read()? as u64;
                (hi << 8) | lo
            }
            0x1a => {
                let mut v = 0u64;
                for _ in 0..4 {
                    v = (v << 8) | self.read()? as u64;
                }
                v
            }
            _ => return Err(Error::CborMalformed),
        };
        if major == CBOR_UINT_1BYTE_START {
            Ok(magnitude as i64)
        } else {
            Ok(-1 - magnitude as i64)
        }
    }

    /// Get the raw one-byte int encoding, either sign.
    pub fn int_raw(&mut self) -> Result<u8, Error> {
        let n = self.read()?;
        if Self::is_int_byte(n) {
            Ok(n)
        } else {
            Err(Error::CborUnexpectedType)
        }
    }

    /// Decode a text string slice.
    pub fn str(&mut self) -> Result<&'a [u8], Error> {
        let b = self.read()?;
        if CBOR_MAJOR_TEXT_STRING != Self::type_of(b) {
            Err(Error::CborUnexpectedType)
        } else if Self::info_of(b) == 31 {
            Err(Error::CborMalformed)
        } else {
            let n = self.as_usize(Self::info_of(b))?;
            self.read_slice(n)
        }
    }

    /// Decode a byte string slice.
    pub fn bytes(&mut self) -> Result<&'a [u8], Error> {
        let b = self.read()?;
        if CBOR_MAJOR_BYTE_STRING != Self::type_of(b) {
            Err(Error::CborUnexpectedType)
        } else if Self::info_of(b) == 31 {
            Err(Error::CborMalformed)
        } else {
            let n = self.as_usize(Self::info_of(b))?;
            self.read_slice(n)
        }
    }

    /// Decode a byte string of an expected size.
    pub fn bytes_sized(&mut self, expected_size: usize) -> Result<&'a [u8], Error> {
        let res = self.bytes()?;
        if res.len() == expected_size {
            Ok(res)
        } else {
            Err(Error::CborMalformed)
        }
    }

    /// Begin decoding a definite-length array.
    pub fn array(&mut self) -> Result<usize, Error> {
        let b = self.read()?;
        if CBOR_MAJOR_ARRAY != Self::type_of(b) {
            Err(Error::CborUnexpectedType)
        } else {
            match Self::info_of(b) {
                31 => Err(Error::CborMalformed), // no support for unknown size arrays
                n => self.as_usize(n),
            }
        }
    }

    /// Begin decoding a definite-length map; returns the number of pairs.
    pub fn map(&mut self) -> Result<usize, Error> {
        let b = self.read()?;
        if CBOR_MAJOR_MAP != Self::type_of(b) {
            Err(Error::CborUnexpectedType)
        } else {
            match Self::info_of(b) {
                31 => Err(Error::CborMalformed),
                n => self.as_usize(n),
            }
        }
    }

    pub fn null(&mut self) -> Result<(), Error> {
        if self.read()? == CBOR_NULL {
            Ok(())
        } else {
            Err(Error::CborUnexpectedType)
        }
    }

    /// Decode a length argument into usize.
    fn as_usize(&mut self, b: u8) -> Result<usize, Error> {
        if (0..=0x17).contains(&b) {
            Ok(usize::from(b))
        } else if 0x18 == b {
            self.read().map(usize::from)
        } else if 0x19 == b {
            let hi = self.read()? as usize;
            let lo = self.read()? as usize;
            Ok((hi << 8) | lo)
        } else {
            Err(Error::CborMalformed)
        }
    }

    /// Skip over one complete data item of any supported kind.
    pub fn skip_item(&mut self) -> Result<(), Error> {
        let b = self.current()?;
        match Self::type_of(b) {
            t if t == CBOR_UINT_1BYTE_START || t == CBOR_NEG_INT_1BYTE_START => {
                self.i64().map(|_| ())
            }
            t if t == CBOR_MAJOR_BYTE_STRING => self.bytes().map(|_| ()),
            t if t == CBOR_MAJOR_TEXT_STRING => self.str().map(|_| ()),
            t if t == CBOR_MAJOR_ARRAY => {
                let n = self.array()?;
                for _ in 0..n {
                    self.skip_item()?;
                }
                Ok(())
            }
            t if t == CBOR_MAJOR_MAP => {
                let n = self.map()?;
                for _ in 0..n {
                    self.skip_item()?;
                    self.skip_item()?;
                }
                Ok(())
            }
            _ if b == CBOR_NULL => self.null(),
            _ => Err(Error::CborUnexpectedType),
        }
    }

    /// Get the major type info of the given byte (highest 3 bits).
    pub fn type_of(b: u8) -> u8 {
        b & 0b111_00000
    }

    /// Get the additional type info of the given byte (lowest 5 bits).
    pub fn info_of(b: u8) -> u8 {
        b & 0b000_11111
    }

    /// Check for: an unsigned integer encoded as a single byte
    pub fn is_u8(byte: u8) -> bool {
        (CBOR_UINT_1BYTE_START..=CBOR_UINT_1BYTE_END).contains(&byte)
    }

    /// Check for: a negative integer encoded as a single byte
    pub fn is_i8(byte: u8) -> bool {
        (CBOR_NEG_INT_1BYTE_START..=CBOR_NEG_INT_1BYTE_END).contains(&byte)
    }

    /// Check for: any integer encoded as a single byte
    pub fn is_int_byte(byte: u8) -> bool {
        Self::is_u8(byte) || Self::is_i8(byte)
    }
}

/// Minimal-length CBOR encoder over a caller-provided buffer.
#[derive(Debug)]
pub struct CborEncoder<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> CborEncoder<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        CborEncoder { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[..self.pos]
    }

    fn write(&mut self, byte: u8) -> Result<(), Error> {
        if let Some(slot) = self.buf.get_mut(self.pos) {
            *slot = byte;
            self.pos += 1;
            Ok(())
        } else {
            Err(Error::BufferTooSmall)
        }
    }

    fn write_slice(&mut self, slice: &[u8]) -> Result<(), Error> {
        if let Some(end) = self.pos.checked_add(slice.len()) {
            if let Some(window) = self.buf.get_mut(self.pos..end) {
                window.copy_from_slice(slice);
                self.pos = end;
                return Ok(());
            }
        }
        Err(Error::BufferTooSmall)
    }

    fn write_type_and_arg(&mut self, major: u8, arg: u64) -> Result<(), Error> {
        if arg < 24 {
            self.write(major | arg as u8)
        } else if arg <= 0xff {
            self.write(major | 24)?;
            self.write(arg as u8)
        } else if arg <= 0xffff {
            self.write(major | 25)?;
            self.write((arg >> 8) as u8)?;
            self.write(arg as u8)
        } else if arg <= 0xffff_ffff {
            self.write(major | 26)?;
            self.write_slice(&(arg as u32).to_be_bytes())
        } else {
            self.write(major | 27)?;
            self.write_slice(&arg.to_be_bytes())
        }
    }

    pub fn uint(&mut self, value: u64) -> Result<(), Error> {
        self.write_type_and_arg(CBOR_UINT_1BYTE_START, value)
    }

    pub fn int(&mut self, value: i64) -> Result<(), Error> {
        if value >= 0 {
            self.uint(value as u64)
        } else {
            self.write_type_and_arg(CBOR_NEG_INT_1BYTE_START, (-1 - value) as u64)
        }
    }

    pub fn bytes(&mut self, value: &[u8]) -> Result<(), Error> {
        self.write_type_and_arg(CBOR_MAJOR_BYTE_STRING, value.len() as u64)?;
        self.write_slice(value)
    }

    /// Emit only the byte string header; the caller appends the content
    /// with [Self::raw]. Used for `bstr(G_Y || CIPHERTEXT_2)`.
    pub fn bytes_header(&mut self, len: usize) -> Result<(), Error> {
        self.write_type_and_arg(CBOR_MAJOR_BYTE_STRING, len as u64)
    }

    pub fn text(&mut self, value: &str) -> Result<(), Error> {
        self.write_type_and_arg(CBOR_MAJOR_TEXT_STRING, value.len() as u64)?;
        self.write_slice(value.as_bytes())
    }

    pub fn array(&mut self, len: usize) -> Result<(), Error> {
        self.write_type_and_arg(CBOR_MAJOR_ARRAY, len as u64)
    }

    pub fn map(&mut self, pairs: usize) -> Result<(), Error> {
        self.write_type_and_arg(CBOR_MAJOR_MAP, pairs as u64)
    }

    pub fn null(&mut self) -> Result<(), Error> {
        self.write(CBOR_NULL)
    }

    /// Append pre-encoded CBOR verbatim.
    pub fn raw(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.write_slice(bytes)
    }
}
