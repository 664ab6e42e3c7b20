use std::io::{ErrorKind, Read, Write};

use burn_core::{BufferReader, BufferWriter};
use tracing::warn;

use crate::error::PipeError;

pub const PROTOCOL_VERSION: u32 = 1;

const MAX_TOKEN_BYTES: u32 = 4096;
const ACK_ACCEPTED: u32 = 1;
const ACK_REJECTED: u32 = 0;

/// Child side: present the token and protocol version, then wait for the
/// parent's verdict.
pub fn present_token<S: Read + Write>(stream: &mut S, token: &str) -> Result<(), PipeError> {
    let mut buffer = BufferWriter::new();
    buffer.write_string(token).write_u32(PROTOCOL_VERSION);
    stream.write_all(&buffer.into_bytes())?;
    stream.flush()?;

    match read_u32(stream)? {
        ACK_ACCEPTED => Ok(()),
        _ => Err(PipeError::HandshakeRejected),
    }
}

/// Parent side: read the child's token and version and accept the
/// connection only when both match.
pub fn verify_token<S: Read + Write>(stream: &mut S, expected: &str) -> Result<(), PipeError> {
    let count = read_u32(stream)?;
    if count > MAX_TOKEN_BYTES {
        reply(stream, ACK_REJECTED)?;
        return Err(PipeError::MessageTooLarge {
            size: count,
            max: MAX_TOKEN_BYTES,
        });
    }

    let mut framed = Vec::with_capacity(count as usize + 8);
    framed.extend_from_slice(&count.to_le_bytes());
    framed.resize(count as usize + 4, 0);
    read_exact(stream, &mut framed[4..])?;
    let version = read_u32(stream)?;

    let token = BufferReader::new(&framed).read_optional_string()?;
    if token.as_deref() != Some(expected) {
        warn!("rejecting pipe connection with a mismatched token");
        reply(stream, ACK_REJECTED)?;
        return Err(PipeError::TokenMismatch);
    }
    if version != PROTOCOL_VERSION {
        warn!(remote = version, "rejecting pipe connection with a different protocol version");
        reply(stream, ACK_REJECTED)?;
        return Err(PipeError::VersionMismatch {
            local: PROTOCOL_VERSION,
            remote: version,
        });
    }
    reply(stream, ACK_ACCEPTED)
}

fn reply<W: Write>(stream: &mut W, ack: u32) -> Result<(), PipeError> {
    stream.write_all(&ack.to_le_bytes())?;
    stream.flush()?;
    Ok(())
}

fn read_u32<R: Read>(stream: &mut R) -> Result<u32, PipeError> {
    let mut bytes = [0_u8; 4];
    read_exact(stream, &mut bytes)?;
    Ok(u32::from_le_bytes(bytes))
}

fn read_exact<R: Read>(stream: &mut R, buf: &mut [u8]) -> Result<(), PipeError> {
    stream.read_exact(buf).map_err(|err| {
        if err.kind() == ErrorKind::UnexpectedEof {
            PipeError::Closed
        } else {
            PipeError::Io(err)
        }
    })
}
