use std::io::{self, Read, Write};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use http::{Method, Response, StatusCode};
use serde_json::{Value, json};

use crate::logging::{LogLevel, Logger};
use crate::net::http_head::{HeadError, read_head};
use crate::net::{Conn, VirtualListener};

use super::AgentHandle;

const MAX_REQUEST_HEAD_BYTES: usize = 16 * 1024;
const REQUEST_READ_TIMEOUT: Duration = Duration::from_secs(10);

pub struct StatusServer {
    handle: AgentHandle,
    logger: Arc<Logger>,
    started_at: chrono::DateTime<Utc>,
}

impl StatusServer {
    pub fn new(handle: AgentHandle, logger: Arc<Logger>) -> Self {
        Self {
            handle,
            logger,
            started_at: Utc::now(),
        }
    }

    pub fn spawn(self, listener: Arc<VirtualListener<Conn>>) -> JoinHandle<()> {
        let server = Arc::new(self);
        thread::spawn(move || {
            while let Ok(conn) = listener.accept() {
                let server = Arc::clone(&server);
                thread::spawn(move || server.serve_connection(conn));
            }
            server
                .logger
                .debug(Some("agent::status"), "Local listener closed");
        })
    }

    fn serve_connection(&self, mut conn: Conn) {
        if let Err(error) = self.respond(&mut conn) {
            self.logger.log(
                LogLevel::Debug,
                Some("agent::status"),
                "Status request failed",
                Some(json!({
                    "peer": conn.peer_addr().to_string(),
                    "error": error.to_string(),
                })),
            );
        }
        let _ = conn.shutdown();
    }

    fn respond(&self, conn: &mut Conn) -> io::Result<()> {
        conn.set_read_timeout(Some(REQUEST_READ_TIMEOUT))?;
        let response = match read_request_line(conn)? {
            Some((method, path)) if is_status_request(&method, &path) => {
                json_response(StatusCode::OK, &self.snapshot())
            }
            Some(_) => json_response(StatusCode::NOT_FOUND, &json!({ "error": "not found" })),
            None => json_response(
                StatusCode::BAD_REQUEST,
                &json!({ "error": "malformed request" }),
            ),
        };
        write_response(conn, &response)
    }

    pub fn snapshot(&self) -> Value {
        json!({
            "agent_id": self.handle.agent_id(),
            "state": self.handle.state().as_str(),
            "started_at": self.started_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            "version": env!("CARGO_PKG_VERSION"),
        })
    }
}

fn read_request_line<R: Read>(reader: &mut R) -> io::Result<Option<(Method, String)>> {
    let head = match read_head(reader, MAX_REQUEST_HEAD_BYTES) {
        Ok(head) => head,
        Err(HeadError::Io(source)) => return Err(source),
        Err(_) => return Ok(None),
    };

    let mut parts = head.start_line.splitn(3, ' ');
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Ok(None);
    };
    if !version.starts_with("HTTP/1.") {
        return Ok(None);
    }
    let Ok(method) = Method::from_bytes(method.as_bytes()) else {
        return Ok(None);
    };
    let path = target.split('?').next().unwrap_or_default();
    Ok(Some((method, path.to_owned())))
}

fn is_status_request(method: &Method, path: &str) -> bool {
    *method == Method::GET && (path == "/" || path == "/status")
}

fn json_response(status: StatusCode, body: &Value) -> Response<Vec<u8>> {
    let mut response = Response::new(body.to_string().into_bytes());
    *response.status_mut() = status;
    response
}

fn write_response<W: Write>(writer: &mut W, response: &Response<Vec<u8>>) -> io::Result<()> {
    let status = response.status();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    );
    head.push_str("Content-Type: application/json\r\n");
    head.push_str(&format!("Content-Length: {}\r\n", response.body().len()));
    head.push_str("Connection: close\r\n\r\n");

    writer.write_all(head.as_bytes())?;
    writer.write_all(response.body())?;
    writer.flush()
}
