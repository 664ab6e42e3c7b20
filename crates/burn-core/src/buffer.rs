//! Flat buffer serialization shared by both ends of the engine pipes and by
//! persisted resume state.
//!
//! Numbers are fixed-width little-endian. Strings are written as a `u32` byte
//! count (including the terminating null) followed by UTF-16LE code units and
//! the null terminator. A zero byte count encodes an absent string, which keeps
//! `None` distinct from `Some("")`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    #[error("buffer truncated at offset {offset}: needed {needed} more bytes")]
    Truncated { offset: usize, needed: usize },
    #[error("string at offset {offset} has odd byte count {count}")]
    OddStringLength { offset: usize, count: usize },
    #[error("string at offset {offset} is missing its null terminator")]
    MissingTerminator { offset: usize },
    #[error("string at offset {offset} is not valid UTF-16")]
    InvalidUtf16 { offset: usize },
    #[error("expected a string but found an absent value at offset {offset}")]
    UnexpectedNull { offset: usize },
}

#[derive(Debug, Default, Clone)]
pub struct BufferWriter {
    data: Vec<u8>,
}

impl BufferWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u32(&mut self, value: u32) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_u64(&mut self, value: u64) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_i64(&mut self, value: i64) -> &mut Self {
        self.data.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn write_bool(&mut self, value: bool) -> &mut Self {
        self.write_u32(u32::from(value))
    }

    pub fn write_string(&mut self, value: &str) -> &mut Self {
        self.write_optional_string(Some(value))
    }

    pub fn write_optional_string(&mut self, value: Option<&str>) -> &mut Self {
        let Some(value) = value else {
            return self.write_u32(0);
        };
        let units = value.encode_utf16().chain(std::iter::once(0)).collect::<Vec<_>>();
        self.write_u32((units.len() * 2) as u32);
        for unit in units {
            self.data.extend_from_slice(&unit.to_le_bytes());
        }
        self
    }

    pub fn write_bytes(&mut self, value: &[u8]) -> &mut Self {
        self.write_u32(value.len() as u32);
        self.data.extend_from_slice(value);
        self
    }

    pub fn write_strings(&mut self, values: &[String]) -> &mut Self {
        self.write_u32(values.len() as u32);
        for value in values {
            self.write_string(value);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

#[derive(Debug, Clone)]
pub struct BufferReader<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> BufferReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }

    fn take(&mut self, count: usize) -> Result<&'a [u8], BufferError> {
        if self.remaining() < count {
            return Err(BufferError::Truncated {
                offset: self.offset,
                needed: count - self.remaining(),
            });
        }
        let slice = &self.data[self.offset..self.offset + count];
        self.offset += count;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, BufferError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, BufferError> {
        let bytes = self.take(8)?;
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    pub fn read_i64(&mut self) -> Result<i64, BufferError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_bool(&mut self) -> Result<bool, BufferError> {
        Ok(self.read_u32()? != 0)
    }

    pub fn read_optional_string(&mut self) -> Result<Option<String>, BufferError> {
        let start = self.offset;
        let count = self.read_u32()? as usize;
        if count == 0 {
            return Ok(None);
        }
        if count % 2 != 0 {
            return Err(BufferError::OddStringLength {
                offset: start,
                count,
            });
        }

        let bytes = self.take(count)?;
        let mut units = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect::<Vec<_>>();
        if units.pop() != Some(0) {
            return Err(BufferError::MissingTerminator { offset: start });
        }
        String::from_utf16(&units)
            .map(Some)
            .map_err(|_| BufferError::InvalidUtf16 { offset: start })
    }

    pub fn read_string(&mut self) -> Result<String, BufferError> {
        let start = self.offset;
        self.read_optional_string()?
            .ok_or(BufferError::UnexpectedNull { offset: start })
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, BufferError> {
        let count = self.read_u32()? as usize;
        Ok(self.take(count)?.to_vec())
    }

    pub fn read_strings(&mut self) -> Result<Vec<String>, BufferError> {
        let count = self.read_u32()? as usize;
        let mut values = Vec::with_capacity(count.min(self.remaining() / 4));
        for _ in 0..count {
            values.push(self.read_string()?);
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_encoding_counts_bytes_including_terminator() {
        let mut writer = BufferWriter::new();
        writer.write_string("ab");
        let bytes = writer.into_bytes();
        assert_eq!(&bytes[..4], &6_u32.to_le_bytes());
        assert_eq!(&bytes[4..], &[b'a', 0, b'b', 0, 0, 0]);
    }

    #[test]
    fn embedded_null_survives_round_trip() {
        let value = "before\0after";
        let mut writer = BufferWriter::new();
        writer.write_string(value).write_u32(7);
        let bytes = writer.into_bytes();

        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_string().expect("string must decode"), value);
        assert_eq!(reader.read_u32().expect("number must decode"), 7);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn absent_and_empty_strings_stay_distinct() {
        let mut writer = BufferWriter::new();
        writer.write_optional_string(None).write_optional_string(Some(""));
        let bytes = writer.into_bytes();

        let mut reader = BufferReader::new(&bytes);
        assert_eq!(reader.read_optional_string().expect("must decode"), None);
        assert_eq!(
            reader.read_optional_string().expect("must decode"),
            Some(String::new())
        );
    }

    #[test]
    fn truncated_buffer_reports_offset() {
        let mut writer = BufferWriter::new();
        writer.write_string("abc");
        let mut bytes = writer.into_bytes();
        bytes.truncate(6);

        let err = BufferReader::new(&bytes)
            .read_string()
            .expect_err("truncated string must fail");
        assert!(matches!(err, BufferError::Truncated { offset: 4, .. }));
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let mut bytes = 2_u32.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[b'a', 0]);
        let err = BufferReader::new(&bytes)
            .read_string()
            .expect_err("unterminated string must fail");
        assert_eq!(err, BufferError::MissingTerminator { offset: 0 });
    }
}
