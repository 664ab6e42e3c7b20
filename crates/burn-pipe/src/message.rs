use std::io::{ErrorKind, Read, Write};

use crate::error::PipeError;

/// One-way diagnostic text; never answered with COMPLETE.
pub const MESSAGE_LOG: u32 = 0xF000_0001;
/// Answers a command with a `u32` result code.
pub const MESSAGE_COMPLETE: u32 = 0xF000_0002;
/// Ends a message pump with a `u32` exit code.
pub const MESSAGE_TERMINATE: u32 = 0xF000_0003;

/// Upper bound checked before a payload buffer is allocated.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

const HEADER_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeMessage {
    pub id: u32,
    pub data: Vec<u8>,
}

impl PipeMessage {
    pub fn new(id: u32, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn is_reserved(&self) -> bool {
        is_reserved_id(self.id)
    }
}

pub fn is_reserved_id(id: u32) -> bool {
    matches!(id, MESSAGE_LOG | MESSAGE_COMPLETE | MESSAGE_TERMINATE)
}

/// Writes `[id][length][payload]`, all integers little-endian.
pub fn write_message<W: Write>(writer: &mut W, id: u32, data: &[u8]) -> Result<(), PipeError> {
    let size = u32::try_from(data.len())
        .ok()
        .filter(|size| *size <= MAX_MESSAGE_SIZE)
        .ok_or(PipeError::MessageTooLarge {
            size: u32::try_from(data.len()).unwrap_or(u32::MAX),
            max: MAX_MESSAGE_SIZE,
        })?;
    let mut header = [0_u8; HEADER_LEN];
    header[..4].copy_from_slice(&id.to_le_bytes());
    header[4..].copy_from_slice(&size.to_le_bytes());
    writer.write_all(&header)?;
    writer.write_all(data)?;
    writer.flush()?;
    Ok(())
}

/// Reads one message. A stream that ends cleanly between messages yields
/// `None`; one that ends inside a message is an error.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<PipeMessage>, PipeError> {
    let mut header = [0_u8; HEADER_LEN];
    let mut filled = 0;
    while filled < HEADER_LEN {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(PipeError::Closed),
            Ok(read) => filled += read,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(PipeError::Io(err)),
        }
    }

    let id = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    let size = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if size > MAX_MESSAGE_SIZE {
        return Err(PipeError::MessageTooLarge {
            size,
            max: MAX_MESSAGE_SIZE,
        });
    }

    let mut data = vec![0_u8; size as usize];
    reader.read_exact(&mut data).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            PipeError::Closed
        } else {
            PipeError::Io(err)
        }
    })?;
    Ok(Some(PipeMessage { id, data }))
}

pub(crate) fn decode_code(data: &[u8]) -> Result<u32, PipeError> {
    let bytes: [u8; 4] = data
        .get(..4)
        .and_then(|bytes| bytes.try_into().ok())
        .ok_or(PipeError::Buffer(burn_core::BufferError::Truncated {
            offset: 0,
            needed: 4 - data.len().min(4),
        }))?;
    Ok(u32::from_le_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn reads_back_written_messages_in_order() {
        let mut wire = Vec::new();
        write_message(&mut wire, 7, &[]).expect("empty message writes");
        write_message(&mut wire, 8, &[1, 2, 3]).expect("message writes");
        assert_eq!(&wire[..8], &[7, 0, 0, 0, 0, 0, 0, 0]);

        let mut reader = Cursor::new(wire);
        let first = read_message(&mut reader)
            .expect("first message reads")
            .expect("first message present");
        assert_eq!(first, PipeMessage::new(7, Vec::new()));
        let second = read_message(&mut reader)
            .expect("second message reads")
            .expect("second message present");
        assert_eq!(second, PipeMessage::new(8, vec![1, 2, 3]));
        assert!(read_message(&mut reader).expect("clean end").is_none());
    }

    #[test]
    fn truncated_message_is_an_error() {
        let mut wire = Vec::new();
        write_message(&mut wire, 9, &[1, 2, 3, 4]).expect("message writes");
        wire.truncate(10);
        let err = read_message(&mut Cursor::new(wire)).expect_err("truncation must fail");
        assert!(matches!(err, PipeError::Closed));
    }

    #[test]
    fn oversized_length_is_rejected_before_allocation() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&1_u32.to_le_bytes());
        wire.extend_from_slice(&u32::MAX.to_le_bytes());
        let err = read_message(&mut Cursor::new(wire)).expect_err("oversize must fail");
        assert!(matches!(err, PipeError::MessageTooLarge { size: u32::MAX, .. }));
    }

    #[test]
    fn reserved_ids_are_recognized() {
        assert!(is_reserved_id(MESSAGE_LOG));
        assert!(is_reserved_id(MESSAGE_COMPLETE));
        assert!(is_reserved_id(MESSAGE_TERMINATE));
        assert!(!is_reserved_id(1));
    }
}
