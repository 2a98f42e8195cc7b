#![forbid(unsafe_code)]
//! Varint and cursor helpers used by the on-page record decoders.

pub mod var {
    //! Unsigned LEB128 varints.

    use crate::types::{CheckError, Result};

    /// Encodes a u64 as an unsigned varint.
    pub fn encode_u64(mut v: u64, out: &mut Vec<u8>) {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
    }

    /// Decodes a u64 varint from a slice, advancing `off`.
    ///
    /// Truncated or over-long encodings are reported as format errors, never panics,
    /// because the bytes come from pages that may be damaged.
    pub fn decode_u64(src: &[u8], off: &mut usize) -> Result<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        for i in 0..10 {
            let byte = *src
                .get(*off)
                .ok_or(CheckError::Format("varint truncated"))?;
            *off += 1;
            let payload = (byte & 0x7f) as u64;
            if i == 9 && payload > 1 {
                return Err(CheckError::Format("varint overflows 64 bits"));
            }
            result |= payload << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
        Err(CheckError::Format("varint longer than 10 bytes"))
    }

    /// Number of bytes [`encode_u64`] emits for `value`.
    pub fn encoded_len(mut value: u64) -> usize {
        let mut len = 1;
        while value >= 0x80 {
            value >>= 7;
            len += 1;
        }
        len
    }
}

pub mod buf {
    //! A slice-backed cursor for bounds-checked parsing.

    use super::var;
    use crate::types::{CheckError, Result};

    /// Reads big-endian fields from a byte slice, failing on truncation.
    pub struct Cursor<'a> {
        buf: &'a [u8],
        off: usize,
    }

    impl<'a> Cursor<'a> {
        pub fn new(buf: &'a [u8]) -> Self {
            Self { buf, off: 0 }
        }

        pub fn position(&self) -> usize {
            self.off
        }

        pub fn remaining(&self) -> usize {
            self.buf.len() - self.off
        }

        pub fn take(&mut self, n: usize, what: &'static str) -> Result<&'a [u8]> {
            let end = self
                .off
                .checked_add(n)
                .filter(|end| *end <= self.buf.len())
                .ok_or(CheckError::Format(what))?;
            let out = &self.buf[self.off..end];
            self.off = end;
            Ok(out)
        }

        pub fn read_u8(&mut self, what: &'static str) -> Result<u8> {
            Ok(self.take(1, what)?[0])
        }

        pub fn read_u16(&mut self, what: &'static str) -> Result<u16> {
            let raw = self.take(2, what)?;
            Ok(u16::from_be_bytes([raw[0], raw[1]]))
        }

        pub fn read_u64(&mut self, what: &'static str) -> Result<u64> {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(self.take(8, what)?);
            Ok(u64::from_be_bytes(raw))
        }

        pub fn read_var_u64(&mut self) -> Result<u64> {
            var::decode_u64(self.buf, &mut self.off)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{buf::Cursor, var};

    #[test]
    fn varint_roundtrip_and_length() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut out = Vec::new();
            var::encode_u64(value, &mut out);
            assert_eq!(out.len(), var::encoded_len(value));
            let mut off = 0;
            assert_eq!(var::decode_u64(&out, &mut off).unwrap(), value);
            assert_eq!(off, out.len());
        }
    }

    #[test]
    fn truncated_varint_is_an_error() {
        let mut off = 0;
        assert!(var::decode_u64(&[0x80, 0x80], &mut off).is_err());
    }

    #[test]
    fn cursor_rejects_reads_past_end() {
        let mut cursor = Cursor::new(&[0, 1, 2]);
        assert_eq!(cursor.read_u16("short").unwrap(), 1);
        assert_eq!(cursor.remaining(), 1);
        assert!(cursor.read_u16("short").is_err());
        assert_eq!(cursor.read_u8("short").unwrap(), 2);
    }
}
