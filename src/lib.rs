//! h1conn - low-level HTTP/1.1 connection machinery
//!
//! This crate turns a raw bidirectional byte stream (a TCP socket) into a
//! sequence of correctly framed HTTP/1.1 messages and manages that stream's
//! lifecycle. It deliberately stops below message semantics: routing,
//! connection pooling, cookies and header grammar are the caller's concern.
//!
//! # Architecture
//!
//! - [`Connection`] owns the socket and both session buffers and drives
//!   bind/open/close/shutdown and staleness detection
//! - [`SessionInputBuffer`]/[`SessionOutputBuffer`] are the only components
//!   that touch the raw streams, feeding transport metrics as bytes move
//! - [`LengthPolicy`] decides from a message's headers how its body is
//!   delimited, producing a [`BodyLength`]
//! - [`BodyReader`]/[`BodyWriter`] consume/emit exactly the framed bytes of
//!   one message body over a session buffer
//!
//! # Examples
//!
//! ```no_run
//! use h1conn::{Connection, Headers};
//! use std::net::TcpStream;
//!
//! let stream = TcpStream::connect("127.0.0.1:8080").unwrap();
//! let mut conn = Connection::new();
//! conn.bind(stream).unwrap();
//!
//! conn.write_line("GET / HTTP/1.1").unwrap();
//! conn.write_line("Host: localhost").unwrap();
//! conn.write_line("").unwrap();
//! conn.flush().unwrap();
//! conn.count_request();
//!
//! let status_line = conn.read_line().unwrap();
//! // ... collect response headers, then read the framed body:
//! let mut headers = Headers::new();
//! headers.insert("Content-Length", "5");
//! let mut body = conn.prepare_input(&headers).unwrap();
//! let mut buf = [0u8; 5];
//! body.read(&mut buf).unwrap();
//! ```

pub mod buffer;
pub mod conn;
pub mod framing;
pub mod headers;
pub mod metrics;
pub mod strategy;

pub use buffer::{SessionInputBuffer, SessionOutputBuffer};
pub use conn::{Connection, ConnectionConfig, SocketTimeout};
pub use framing::{BodyReader, BodyWriter};
pub use headers::Headers;
pub use metrics::{ConnectionMetrics, TransportMetrics};
pub use strategy::{BodyLength, LengthPolicy};

/// Result type for connection operations
pub type Result<T> = std::result::Result<T, Error>;

/// Connection operation errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Connection is not open")]
    NotOpen,

    #[error("Not bound to a stream")]
    Unbound,

    #[error("Already bound to a stream")]
    AlreadyBound,

    #[error("Invalid chunk size: {0}")]
    InvalidChunkSize(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Normalize timeout-flavored I/O errors into the distinct `Timeout`
    /// variant so callers can tell a slow peer from a dead one.
    pub(crate) fn from_io(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => Error::Timeout,
            _ => Error::Io(err),
        }
    }
}

/// CRLF line ending
pub const CRLF: &str = "\r\n";
