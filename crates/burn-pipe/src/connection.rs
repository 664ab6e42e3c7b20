use std::io::{Read, Write};

use anyhow::Result;
use burn_core::{BufferReader, BufferWriter};
use tracing::{debug, info, warn};

use crate::codes::code_from_error;
use crate::error::PipeError;
use crate::ids;
use crate::message::{
    decode_code, read_message, write_message, PipeMessage, MESSAGE_COMPLETE, MESSAGE_LOG,
    MESSAGE_TERMINATE,
};

/// A framed, bidirectional message channel over any byte stream.
///
/// Commands are strictly request/response: every non-reserved message is
/// answered by exactly one COMPLETE, and the side waiting on a COMPLETE keeps
/// servicing whatever the other side sends in the meantime.
#[derive(Debug)]
pub struct PipeConnection<S> {
    stream: S,
    label: &'static str,
}

impl<S: Read + Write> PipeConnection<S> {
    pub fn new(stream: S, label: &'static str) -> Self {
        Self { stream, label }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn get_ref(&self) -> &S {
        &self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub fn write_message(&mut self, id: u32, data: &[u8]) -> Result<(), PipeError> {
        write_message(&mut self.stream, id, data)
    }

    pub fn read_message(&mut self) -> Result<Option<PipeMessage>, PipeError> {
        read_message(&mut self.stream)
    }

    pub fn send_log(&mut self, text: &str) -> Result<(), PipeError> {
        let mut buffer = BufferWriter::new();
        buffer.write_string(text);
        self.write_message(MESSAGE_LOG, &buffer.into_bytes())
    }

    pub fn complete(&mut self, code: u32) -> Result<(), PipeError> {
        self.write_message(MESSAGE_COMPLETE, &code.to_le_bytes())
    }

    pub fn terminate(&mut self, code: u32) -> Result<(), PipeError> {
        self.write_message(MESSAGE_TERMINATE, &code.to_le_bytes())
    }

    /// Sends a command and blocks until its COMPLETE arrives, handing any
    /// command the other side issues meanwhile to `handler`.
    pub fn send_message<H>(&mut self, id: u32, data: &[u8], mut handler: H) -> Result<u32>
    where
        H: FnMut(&mut Self, PipeMessage) -> Result<u32>,
    {
        debug!(channel = self.label, message = ids::name(id), "sending message");
        self.write_message(id, data)?;

        loop {
            let Some(message) = self.read_message()? else {
                return Err(PipeError::Closed.into());
            };
            match message.id {
                MESSAGE_COMPLETE => return Ok(decode_code(&message.data)?),
                MESSAGE_LOG => self.relay_log(&message.data),
                MESSAGE_TERMINATE => {
                    return Err(PipeError::UnexpectedMessage { id: message.id }.into())
                }
                _ => self.dispatch(message, &mut handler)?,
            }
        }
    }

    /// Services incoming commands until TERMINATE (returning its code) or a
    /// clean end of stream (returning `None`).
    pub fn pump_messages<H>(&mut self, mut handler: H) -> Result<Option<u32>>
    where
        H: FnMut(&mut Self, PipeMessage) -> Result<u32>,
    {
        loop {
            let Some(message) = self.read_message()? else {
                debug!(channel = self.label, "pipe closed while pumping");
                return Ok(None);
            };
            match message.id {
                MESSAGE_TERMINATE => return Ok(Some(decode_code(&message.data)?)),
                MESSAGE_LOG => self.relay_log(&message.data),
                MESSAGE_COMPLETE => {
                    return Err(PipeError::UnexpectedMessage { id: message.id }.into())
                }
                _ => self.dispatch(message, &mut handler)?,
            }
        }
    }

    fn dispatch<H>(&mut self, message: PipeMessage, handler: &mut H) -> Result<(), PipeError>
    where
        H: FnMut(&mut Self, PipeMessage) -> Result<u32>,
    {
        let id = message.id;
        let code = match handler(self, message) {
            Ok(code) => code,
            Err(err) => {
                warn!(
                    channel = self.label,
                    message = ids::name(id),
                    "message handler failed: {err:#}"
                );
                code_from_error(&err)
            }
        };
        self.complete(code)
    }

    fn relay_log(&self, data: &[u8]) {
        match BufferReader::new(data).read_string() {
            Ok(text) => info!(target: "burn::remote", channel = self.label, "{text}"),
            Err(err) => warn!(channel = self.label, "unreadable log message: {err}"),
        }
    }
}

/// Handler for channels where the other side never sends nested commands.
pub fn reject_nested<S>(_: &mut PipeConnection<S>, message: PipeMessage) -> Result<u32> {
    Err(PipeError::UnexpectedMessage { id: message.id }.into())
}
