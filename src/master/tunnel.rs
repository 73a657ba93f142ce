use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::time::Duration;

use http::header::{CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Request, Response, StatusCode, Version};

use crate::net::http_head::{HeadError, read_head};

use super::{DialError, Master};

pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_RESPONSE_HEAD_BYTES: usize = 64 * 1024;
pub const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug)]
pub enum HttpTunnelError {
    Dial(DialError),
    Io(io::Error),
    InvalidRequest(String),
    MalformedResponse(String),
    BodyTooLarge { limit: usize },
}

impl fmt::Display for HttpTunnelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dial(source) => write!(f, "reverse dial failed: {source}"),
            Self::Io(source) => write!(f, "tunnelled request failed: {source}"),
            Self::InvalidRequest(reason) => write!(f, "invalid HTTP request: {reason}"),
            Self::MalformedResponse(reason) => write!(f, "malformed HTTP response: {reason}"),
            Self::BodyTooLarge { limit } => {
                write!(f, "HTTP response body exceeds {limit} bytes")
            }
        }
    }
}

impl std::error::Error for HttpTunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Dial(source) => Some(source),
            Self::Io(source) => Some(source),
            _ => None,
        }
    }
}

impl From<DialError> for HttpTunnelError {
    fn from(source: DialError) -> Self {
        Self::Dial(source)
    }
}

impl From<io::Error> for HttpTunnelError {
    fn from(source: io::Error) -> Self {
        Self::Io(source)
    }
}

#[derive(Clone, Debug)]
pub struct AgentHttpClient {
    master: Master,
    agent_id: String,
    io_timeout: Duration,
}

impl AgentHttpClient {
    pub fn new(master: Master, agent_id: impl Into<String>) -> Self {
        Self {
            master,
            agent_id: agent_id.into(),
            io_timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    pub fn with_io_timeout(mut self, io_timeout: Duration) -> Self {
        self.io_timeout = io_timeout;
        self
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn get(&self, path: &str) -> Result<Response<Vec<u8>>, HttpTunnelError> {
        let request = Request::get(path)
            .body(Vec::new())
            .map_err(|error| HttpTunnelError::InvalidRequest(error.to_string()))?;
        self.send(request)
    }

    pub fn send(&self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HttpTunnelError> {
        let mut conn = self.master.dial(&self.agent_id)?;
        let result = (|| {
            conn.set_read_timeout(Some(self.io_timeout))?;
            conn.set_write_timeout(Some(self.io_timeout))?;
            conn.write_all(&encode_request(&request, &self.agent_id))?;
            conn.flush()?;
            read_response(&mut conn, request.method())
        })();
        let _ = conn.shutdown();
        result
    }
}

fn encode_request(request: &Request<Vec<u8>>, agent_id: &str) -> Vec<u8> {
    let target = request
        .uri()
        .path_and_query()
        .map(|path| path.as_str())
        .unwrap_or("/");

    let mut head = format!("{} {target} HTTP/1.1\r\n", request.method());
    if !request.headers().contains_key(HOST) {
        head.push_str(&format!("Host: {agent_id}\r\n"));
    }

    let mut encoded = head.into_bytes();
    for (name, value) in request.headers() {
        if name == CONNECTION || name == CONTENT_LENGTH || name == TRANSFER_ENCODING {
            continue;
        }
        encoded.extend_from_slice(name.as_str().as_bytes());
        encoded.extend_from_slice(b": ");
        encoded.extend_from_slice(value.as_bytes());
        encoded.extend_from_slice(b"\r\n");
    }

    let body = request.body();
    let method = request.method();
    let sends_body = method == Method::POST || method == Method::PUT || method == Method::PATCH;
    if !body.is_empty() || sends_body {
        encoded.extend_from_slice(format!("Content-Length: {}\r\n", body.len()).as_bytes());
    }
    encoded.extend_from_slice(b"Connection: close\r\n\r\n");
    encoded.extend_from_slice(body);
    encoded
}

fn malformed(reason: impl Into<String>) -> HttpTunnelError {
    HttpTunnelError::MalformedResponse(reason.into())
}

impl From<HeadError> for HttpTunnelError {
    fn from(error: HeadError) -> Self {
        match error {
            HeadError::Io(source) => Self::Io(source),
            HeadError::Incomplete => malformed("connection closed before response head"),
            other => malformed(other.to_string()),
        }
    }
}

fn parse_status_line(line: &str) -> Result<(Version, StatusCode), HttpTunnelError> {
    let mut parts = line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        _ => return Err(malformed(format!("unsupported status line '{line}'"))),
    };
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| malformed(format!("invalid status code in '{line}'")))?;
    Ok((version, status))
}

fn read_response<R: Read>(
    reader: &mut R,
    method: &Method,
) -> Result<Response<Vec<u8>>, HttpTunnelError> {
    let head = read_head(reader, MAX_RESPONSE_HEAD_BYTES)?;
    let (version, status) = parse_status_line(&head.start_line)?;

    let bodyless = *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;
    let body = if bodyless {
        Vec::new()
    } else {
        read_body(&head.headers, head.leftover, reader)?
    };

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.version_mut() = version;
    *response.headers_mut() = head.headers;
    Ok(response)
}

fn read_body<R: Read>(
    headers: &HeaderMap,
    leftover: Vec<u8>,
    reader: &mut R,
) -> Result<Vec<u8>, HttpTunnelError> {
    if headers.contains_key(TRANSFER_ENCODING) {
        return Err(malformed("transfer-encoded bodies are not supported"));
    }
    let content_length = headers
        .get(CONTENT_LENGTH)
        .map(|value| {
            value
                .to_str()
                .ok()
                .and_then(|raw| raw.trim().parse::<usize>().ok())
                .ok_or_else(|| malformed("invalid Content-Length"))
        })
        .transpose()?;

    let mut body_reader = Cursor::new(leftover).chain(reader);
    match content_length {
        Some(length) if length > MAX_RESPONSE_BODY_BYTES => Err(HttpTunnelError::BodyTooLarge {
            limit: MAX_RESPONSE_BODY_BYTES,
        }),
        Some(length) => {
            let mut body = vec![0_u8; length];
            body_reader.read_exact(&mut body)?;
            Ok(body)
        }
        None => {
            let mut body = Vec::new();
            body_reader
                .take(MAX_RESPONSE_BODY_BYTES as u64 + 1)
                .read_to_end(&mut body)?;
            if body.len() > MAX_RESPONSE_BODY_BYTES {
                return Err(HttpTunnelError::BodyTooLarge {
                    limit: MAX_RESPONSE_BODY_BYTES,
                });
            }
            Ok(body)
        }
    }
}
