use std::fmt;
use std::io::{self, Read};

use http::{HeaderMap, HeaderName, HeaderValue};

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug)]
pub enum HeadError {
    Io(io::Error),
    Incomplete,
    TooLarge { limit: usize },
    Malformed(String),
}

impl fmt::Display for HeadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(source) => write!(f, "failed to read HTTP head: {source}"),
            Self::Incomplete => write!(f, "connection closed before the HTTP head ended"),
            Self::TooLarge { limit } => write!(f, "HTTP head exceeds {limit} bytes"),
            Self::Malformed(reason) => write!(f, "malformed HTTP head: {reason}"),
        }
    }
}

impl std::error::Error for HeadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(source) => Some(source),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct RawHead {
    pub start_line: String,
    pub headers: HeaderMap,
    pub leftover: Vec<u8>,
}

pub fn read_head<R: Read>(reader: &mut R, limit: usize) -> Result<RawHead, HeadError> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0_u8; 1024];

    loop {
        if let Some(end) = find_terminator(&buffer) {
            let leftover = buffer.split_off(end + HEAD_TERMINATOR.len());
            buffer.truncate(end);
            return parse_head(buffer, leftover);
        }
        if buffer.len() >= limit {
            return Err(HeadError::TooLarge { limit });
        }

        let read = reader.read(&mut chunk).map_err(HeadError::Io)?;
        if read == 0 {
            return Err(HeadError::Incomplete);
        }
        buffer.extend_from_slice(&chunk[..read]);
    }
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEAD_TERMINATOR.len())
        .position(|window| window == HEAD_TERMINATOR)
}

fn parse_head(head: Vec<u8>, leftover: Vec<u8>) -> Result<RawHead, HeadError> {
    let text = String::from_utf8(head)
        .map_err(|_| HeadError::Malformed("head is not valid UTF-8".to_owned()))?;
    let mut lines = text.split("\r\n");
    let start_line = lines.next().unwrap_or_default().to_owned();

    let mut headers = HeaderMap::new();
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HeadError::Malformed(format!("header line '{line}' has no colon")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|error| HeadError::Malformed(error.to_string()))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|error| HeadError::Malformed(error.to_string()))?;
        headers.append(name, value);
    }

    Ok(RawHead {
        start_line,
        headers,
        leftover,
    })
}
