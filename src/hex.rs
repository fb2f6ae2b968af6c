use crate::error::Error;

const DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Upper case hex digits for one octet.
pub(crate) fn encode_byte(b: u8) -> [u8; 2] {
    [DIGITS[(b >> 4) as usize], DIGITS[(b & 0x0F) as usize]]
}

pub(crate) fn nibble(c: u8) -> Result<u8, Error> {
    match c {
        b'0'..=b'9' => Ok(c - b'0'),
        b'a'..=b'f' => Ok(c - b'a' + 10),
        b'A'..=b'F' => Ok(c - b'A' + 10),
        _ => Err(Error::Parse),
    }
}

/// Incremental decoder fed one hex digit at a time.
#[derive(Debug, Default)]
pub(crate) struct HexDecoder {
    high: Option<u8>,
}

impl HexDecoder {
    /// Returns a decoded octet every second digit.
    pub(crate) fn push(&mut self, c: u8) -> Result<Option<u8>, Error> {
        let n = nibble(c)?;
        Ok(match self.high.take() {
            None => {
                self.high = Some(n);
                None
            }
            Some(high) => Some((high << 4) | n),
        })
    }

    /// An odd number of digits is malformed.
    pub(crate) fn finish(&self) -> Result<(), Error> {
        match self.high {
            None => Ok(()),
            Some(_) => Err(Error::Parse),
        }
    }
}
