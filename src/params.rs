use heapless::{String, Vec};

use crate::error::Error;
use crate::framer::{parse_i32, parse_u64, MAX_NUMBER_LEN};
use crate::hex::HexDecoder;

/// A typed AT command parameter.
///
/// Strings and byte sequences borrow their data, so the length travels with
/// the value. `Bytes` are written raw with no escaping; by convention the
/// module learns their length from a preceding integer parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Parameter<'p> {
    Int(i32),
    Uint64(u64),
    Str { value: &'p str, quoted: bool },
    Bytes(&'p [u8]),
}

impl<'p> Parameter<'p> {
    pub const fn quoted(value: &'p str) -> Self {
        Parameter::Str {
            value,
            quoted: true,
        }
    }

    pub const fn bare(value: &'p str) -> Self {
        Parameter::Str {
            value,
            quoted: false,
        }
    }
}

impl From<i32> for Parameter<'_> {
    fn from(v: i32) -> Self {
        Parameter::Int(v)
    }
}

impl From<u64> for Parameter<'_> {
    fn from(v: u64) -> Self {
        Parameter::Uint64(v)
    }
}

impl<'p> From<&'p [u8]> for Parameter<'p> {
    fn from(v: &'p [u8]) -> Self {
        Parameter::Bytes(v)
    }
}

/// Renders `v` in decimal into the tail of `out`.
pub(crate) fn format_u64(mut v: u64, out: &mut [u8; 20]) -> &[u8] {
    let mut pos = out.len();
    loop {
        pos -= 1;
        out[pos] = b'0' + (v % 10) as u8;
        v /= 10;
        if v == 0 {
            break;
        }
    }
    &out[pos..]
}

/// Collects the characters of a numeric parameter.
#[derive(Debug, Default)]
pub(crate) struct NumberSink {
    digits: Vec<u8, MAX_NUMBER_LEN>,
    overflow: bool,
}

impl NumberSink {
    pub(crate) fn push(&mut self, c: u8) {
        if self.digits.push(c).is_err() {
            self.overflow = true;
        }
    }

    pub(crate) fn int(&self) -> Result<i32, Error> {
        if self.overflow {
            return Err(Error::Parse);
        }
        parse_i32(&self.digits)
    }

    pub(crate) fn uint64(&self) -> Result<u64, Error> {
        if self.overflow {
            return Err(Error::Parse);
        }
        parse_u64(&self.digits)
    }
}

/// Copies into an optional caller buffer while counting the full length.
pub(crate) struct SliceSink<'b> {
    buf: Option<&'b mut [u8]>,
    len: usize,
}

impl<'b> SliceSink<'b> {
    pub(crate) fn new(buf: Option<&'b mut [u8]>) -> Self {
        Self { buf, len: 0 }
    }

    pub(crate) fn push(&mut self, c: u8) {
        if let Some(slot) = self.buf.as_deref_mut().and_then(|b| b.get_mut(self.len)) {
            *slot = c;
        }
        self.len += 1;
    }

    pub(crate) fn extend(&mut self, bytes: &[u8]) {
        if let Some(buf) = self.buf.as_deref_mut() {
            if self.len < buf.len() {
                let n = bytes.len().min(buf.len() - self.len);
                buf[self.len..self.len + n].copy_from_slice(&bytes[..n]);
            }
        }
        self.len += bytes.len();
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }
}

/// Collects a text parameter into an owned string.
#[derive(Debug, Default)]
pub(crate) struct TextSink<const L: usize> {
    bytes: Vec<u8, L>,
    overflow: bool,
}

impl<const L: usize> TextSink<L> {
    pub(crate) fn push(&mut self, c: u8) {
        if self.bytes.push(c).is_err() {
            self.overflow = true;
        }
    }

    pub(crate) fn finish(self) -> Result<String<L>, Error> {
        if self.overflow {
            return Err(Error::Overflow);
        }
        String::from_utf8(self.bytes).map_err(|_| Error::Parse)
    }
}

/// Decodes a hex text parameter into octets.
pub(crate) struct HexSink<'b> {
    out: SliceSink<'b>,
    decoder: HexDecoder,
    error: Option<Error>,
}

impl<'b> HexSink<'b> {
    pub(crate) fn new(buf: Option<&'b mut [u8]>) -> Self {
        Self {
            out: SliceSink::new(buf),
            decoder: HexDecoder::default(),
            error: None,
        }
    }

    pub(crate) fn push(&mut self, c: u8) {
        if self.error.is_some() {
            return;
        }
        match self.decoder.push(c) {
            Ok(Some(b)) => self.out.push(b),
            Ok(None) => {}
            Err(e) => self.error = Some(e),
        }
    }

    pub(crate) fn finish(self) -> Result<usize, Error> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.decoder.finish()?;
        Ok(self.out.len())
    }
}
