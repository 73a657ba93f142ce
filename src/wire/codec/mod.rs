use std::fmt;
use std::io::{self, Cursor, ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use crate::wire::command::{BodyError, Command, CommandRecord};

pub const MAGIC: [u8; 4] = *b"MOLE";
pub const MAGIC_SIZE_BYTES: usize = 4;
pub const LENGTH_SIZE_BYTES: usize = 4;
pub const FRAME_HEADER_SIZE_BYTES: usize = MAGIC_SIZE_BYTES + LENGTH_SIZE_BYTES;
pub const MAX_BODY_SIZE_BYTES: usize = 1024 * 1024;
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(1);

const READ_CHUNK_BYTES: usize = 4 * 1024;

#[derive(Debug)]
pub enum CodecError {
    UnrecognizedHeader { found: [u8; MAGIC_SIZE_BYTES] },
    BodyTooLarge { size: usize, limit: usize },
    ConnectionClosed,
    Io(io::Error),
    Body(BodyError),
}

impl CodecError {
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed)
    }
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnrecognizedHeader { found } => write!(
                f,
                "frame header not recognized: expected {:?}, got {:02x?}",
                String::from_utf8_lossy(&MAGIC),
                found
            ),
            Self::BodyTooLarge { size, limit } => {
                write!(f, "frame body size {size} exceeds limit {limit}")
            }
            Self::ConnectionClosed => write!(f, "connection closed by peer"),
            Self::Io(source) => write!(f, "frame transport error: {source}"),
            Self::Body(source) => write!(f, "frame body error: {source}"),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            Self::Body(source) => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for CodecError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

// Checked before every blocking read; must not race another reader of the socket.
pub trait LivenessProbe {
    fn probe_alive(&self) -> io::Result<()> {
        Ok(())
    }
}

impl LivenessProbe for TcpStream {
    fn probe_alive(&self) -> io::Result<()> {
        let previous = self.read_timeout()?;
        self.set_read_timeout(Some(PROBE_TIMEOUT))?;
        let mut scratch = [0_u8; 1];
        let outcome = self.peek(&mut scratch);
        self.set_read_timeout(previous)?;

        match outcome {
            Ok(0) => Err(io::Error::new(
                ErrorKind::UnexpectedEof,
                "peer closed the connection",
            )),
            Ok(_) => Ok(()),
            Err(error) if matches!(error.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Ok(())
            }
            Err(error) => Err(error),
        }
    }
}

impl LivenessProbe for &[u8] {}

impl<T> LivenessProbe for Cursor<T> {}

impl<T: LivenessProbe + ?Sized> LivenessProbe for &mut T {
    fn probe_alive(&self) -> io::Result<()> {
        (**self).probe_alive()
    }
}

pub fn encode_record(record: &CommandRecord) -> Result<Vec<u8>, CodecError> {
    let body = record.to_body().map_err(CodecError::Body)?;
    if body.len() > MAX_BODY_SIZE_BYTES {
        return Err(CodecError::BodyTooLarge {
            size: body.len(),
            limit: MAX_BODY_SIZE_BYTES,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE_BYTES + body.len());
    frame.extend_from_slice(&MAGIC);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn encode_command(command: &Command) -> Result<Vec<u8>, CodecError> {
    encode_record(&command.to_record())
}

pub fn write_command<W: Write>(writer: &mut W, command: &Command) -> Result<(), CodecError> {
    let frame = encode_command(command)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

// Bytes read past one frame stay buffered for the next `decode`.
pub struct FrameDecoder<R> {
    reader: R,
    buffer: Vec<u8>,
    max_body_size: usize,
}

impl<R: Read + LivenessProbe> FrameDecoder<R> {
    pub fn new(reader: R) -> Self {
        Self::with_max_body_size(reader, MAX_BODY_SIZE_BYTES)
    }

    pub fn with_max_body_size(reader: R, max_body_size: usize) -> Self {
        Self {
            reader,
            buffer: Vec::new(),
            max_body_size,
        }
    }

    pub fn decode(&mut self) -> Result<CommandRecord, CodecError> {
        self.fill_to(FRAME_HEADER_SIZE_BYTES)?;

        if self.buffer[..MAGIC_SIZE_BYTES] != MAGIC {
            let mut found = [0_u8; MAGIC_SIZE_BYTES];
            found.copy_from_slice(&self.buffer[..MAGIC_SIZE_BYTES]);
            self.buffer.clear();
            return Err(CodecError::UnrecognizedHeader { found });
        }

        let mut length = [0_u8; LENGTH_SIZE_BYTES];
        length.copy_from_slice(&self.buffer[MAGIC_SIZE_BYTES..FRAME_HEADER_SIZE_BYTES]);
        let body_len = u32::from_be_bytes(length) as usize;
        if body_len > self.max_body_size {
            self.buffer.clear();
            return Err(CodecError::BodyTooLarge {
                size: body_len,
                limit: self.max_body_size,
            });
        }

        let frame_len = FRAME_HEADER_SIZE_BYTES + body_len;
        self.fill_to(frame_len)?;
        let frame: Vec<u8> = self.buffer.drain(..frame_len).collect();
        CommandRecord::from_body(&frame[FRAME_HEADER_SIZE_BYTES..]).map_err(CodecError::Body)
    }

    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    pub fn get_mut(&mut self) -> &mut R {
        &mut self.reader
    }

    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_parts(self) -> (R, Vec<u8>) {
        (self.reader, self.buffer)
    }

    fn fill_to(&mut self, needed: usize) -> Result<(), CodecError> {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        while self.buffer.len() < needed {
            if let Err(error) = self.reader.probe_alive() {
                if error.kind() == ErrorKind::UnexpectedEof && self.buffer.is_empty() {
                    return Err(CodecError::ConnectionClosed);
                }
                return Err(CodecError::Io(error));
            }
            let read = match self.reader.read(&mut chunk) {
                Ok(0) if self.buffer.is_empty() => return Err(CodecError::ConnectionClosed),
                Ok(0) => {
                    return Err(CodecError::Io(io::Error::new(
                        ErrorKind::UnexpectedEof,
                        format!(
                            "stream ended mid-frame after {} of {needed} bytes",
                            self.buffer.len()
                        ),
                    )));
                }
                Ok(read) => read,
                Err(error) if error.kind() == ErrorKind::Interrupted => continue,
                Err(error) => return Err(CodecError::Io(error)),
            };
            self.buffer.extend_from_slice(&chunk[..read]);
        }
        Ok(())
    }
}
