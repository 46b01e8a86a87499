//! Connection lifecycle controller
//!
//! A [`Connection`] owns one socket and the pair of session buffers over
//! it, and drives everything with a lifecycle: bind, lazy buffer
//! attachment, header and body I/O, staleness probing, graceful close and
//! abrupt shutdown.
//!
//! A connection moves through three states: unbound (no socket), open, and
//! closed. Closed is terminal; a new socket needs a new `Connection`.

use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::framing::{BodyReader, BodyWriter, ChunkedWriter, FixedLengthWriter, IdentityWriter};
use crate::headers::Headers;
use crate::metrics::ConnectionMetrics;
use crate::strategy::{BodyLength, LengthPolicy};
use crate::{Error, Result};
use log::{debug, trace};
use std::fmt;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

/// Tuning knobs for a connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Session buffer capacity per direction, in bytes
    pub buffer_size: usize,
    /// Chunk cache size for chunked body writers
    pub chunk_cache_size: usize,
    /// Timeout for the staleness probe read.
    ///
    /// Kept configurable because timeout granularity varies by platform;
    /// the default is one millisecond.
    pub stale_probe_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            buffer_size: 8 * 1024,
            chunk_cache_size: 2048,
            stale_probe_timeout: Duration::from_millis(1),
        }
    }
}

/// Socket read-timeout setting as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketTimeout {
    /// The socket cannot be queried (closed or in error)
    Unknown,
    /// No timeout; reads block indefinitely
    Off,
    /// Reads time out after this duration
    After(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Unbound,
    Open,
    Closed,
}

/// A single HTTP/1.1 connection over an exclusively owned socket.
///
/// The incoming direction uses the lax framing policy (the peer's framing
/// headers are outside our control), the outgoing direction the strict one
/// (malformed framing must never be emitted). That asymmetry is load
/// bearing; do not unify the two.
pub struct Connection {
    state: State,
    socket: Option<TcpStream>,
    inbuf: SessionInputBuffer<TcpStream>,
    outbuf: SessionOutputBuffer<TcpStream>,
    incoming_policy: LengthPolicy,
    outgoing_policy: LengthPolicy,
    config: ConnectionConfig,
    request_count: u64,
    response_count: u64,
}

impl Connection {
    /// Create a new unbound connection with default configuration
    pub fn new() -> Self {
        Self::with_config(ConnectionConfig::default())
    }

    /// Create a new unbound connection
    pub fn with_config(config: ConnectionConfig) -> Self {
        Connection {
            state: State::Unbound,
            socket: None,
            inbuf: SessionInputBuffer::new(config.buffer_size),
            outbuf: SessionOutputBuffer::new(config.buffer_size),
            incoming_policy: LengthPolicy::Lax,
            outgoing_policy: LengthPolicy::Strict,
            config,
            request_count: 0,
            response_count: 0,
        }
    }

    /// Attach the socket this connection will own.
    ///
    /// Legal exactly once, from the unbound state; the connection is open
    /// afterwards. The socket is owned exclusively from here on and is
    /// closed with the connection.
    pub fn bind(&mut self, socket: TcpStream) -> Result<()> {
        if self.state != State::Unbound {
            return Err(Error::AlreadyBound);
        }
        debug!("binding connection to {:?}", socket.peer_addr().ok());
        self.socket = Some(socket);
        self.state = State::Open;
        Ok(())
    }

    /// Whether the connection is open
    pub fn is_open(&self) -> bool {
        self.state == State::Open
    }

    /// Check the connection is open and lazily bind the session buffers.
    ///
    /// Each buffer is attached to a duplicated handle of the socket on
    /// first use, at most once.
    pub fn ensure_open(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Err(Error::NotOpen);
        }
        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        if !self.inbuf.is_bound() {
            trace!("binding input buffer");
            self.inbuf.bind(socket.try_clone()?)?;
        }
        if !self.outbuf.is_bound() {
            trace!("binding output buffer");
            self.outbuf.bind(socket.try_clone()?)?;
        }
        Ok(())
    }

    /// Read one header or start line from the peer.
    ///
    /// Returns `Ok(None)` on a clean end of stream.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        self.ensure_open()?;
        self.inbuf.read_line()
    }

    /// Write one header or start line to the peer
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.ensure_open()?;
        self.outbuf.write_line(line)
    }

    /// Flush pending output to the socket
    pub fn flush(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.outbuf.flush()
    }

    /// Body reader for a received message, framed per the incoming policy.
    ///
    /// The reader borrows the connection; it must be fully drained or
    /// dropped before the next operation, and the framing guarantees the
    /// next message's start-line begins at the following byte.
    pub fn prepare_input(&mut self, headers: &Headers) -> Result<BodyReader<'_, TcpStream>> {
        self.ensure_open()?;
        let len = self.incoming_policy.body_length(headers)?;
        Ok(BodyReader::new(len, &mut self.inbuf))
    }

    /// Body writer for an outgoing message, framed per the outgoing policy.
    pub fn prepare_output(&mut self, headers: &Headers) -> Result<BodyWriter<'_, TcpStream>> {
        self.ensure_open()?;
        let len = self.outgoing_policy.body_length(headers)?;
        Ok(match len {
            BodyLength::Chunked => BodyWriter::Chunked(ChunkedWriter::with_cache_size(
                &mut self.outbuf,
                self.config.chunk_cache_size,
            )),
            BodyLength::Identity => BodyWriter::Identity(IdentityWriter::new(&mut self.outbuf)),
            BodyLength::Fixed(n) => {
                BodyWriter::Fixed(FixedLengthWriter::new(&mut self.outbuf, n))
            }
        })
    }

    /// Wait for the socket to become readable, without consuming data.
    fn poll_input(&self, timeout: Duration) -> Result<bool> {
        use libc::{poll, pollfd, POLLIN};

        let socket = self.socket.as_ref().ok_or(Error::NotOpen)?;
        let mut pfd = pollfd {
            fd: socket.as_raw_fd(),
            events: POLLIN,
            revents: 0,
        };
        let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let result = unsafe { poll(&mut pfd as *mut pollfd, 1, timeout_ms) };
        if result < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(result > 0)
    }

    /// One bounded fill: wait up to `timeout` for readability, then read.
    ///
    /// The socket's configured read timeout is not touched, so timeout
    /// settings cannot leak across calls.
    fn fill_input_buffer(&mut self, timeout: Duration) -> Result<usize> {
        self.ensure_open()?;
        if !self.poll_input(timeout)? {
            return Err(Error::Timeout);
        }
        self.inbuf.fill_buffer()
    }

    /// Wait up to `timeout` for the start of the next message.
    ///
    /// Returns true as soon as unread input is buffered; a quiet peer
    /// within the timeout reports false rather than an error.
    pub fn await_input(&mut self, timeout: Duration) -> Result<bool> {
        self.ensure_open()?;
        if self.inbuf.has_buffered_data() {
            return Ok(true);
        }
        match self.fill_input_buffer(timeout) {
            Ok(_) | Err(Error::Timeout) => Ok(self.inbuf.has_buffered_data()),
            Err(err) => Err(err),
        }
    }

    /// Probe whether the peer has already closed its side.
    ///
    /// Any state other than open is stale. While open, buffered unread
    /// input means not stale; otherwise a bounded peek with the configured
    /// probe timeout decides: definitive EOF means stale, a timeout means
    /// the peer is merely idle, and any other failure is treated as stale.
    /// Bytes arriving during the probe stay buffered for the next read.
    pub fn is_stale(&mut self) -> bool {
        if self.state != State::Open {
            return true;
        }
        if self.inbuf.has_buffered_data() {
            return false;
        }
        match self.fill_input_buffer(self.config.stale_probe_timeout) {
            Ok(0) => {
                trace!("stale probe saw EOF");
                true
            }
            Ok(_) => false,
            Err(Error::Timeout) => false,
            Err(err) => {
                debug!("stale probe failed: {}", err);
                true
            }
        }
    }

    /// Gracefully close the connection.
    ///
    /// Unread input is dropped, pending output flushed, both socket halves
    /// shut down best-effort, and the socket handles closed unconditionally
    /// even if the half-closes failed. Closing a connection that is not
    /// open is a no-op.
    pub fn close(&mut self) -> Result<()> {
        if self.state != State::Open {
            return Ok(());
        }
        debug!("closing connection {}", self);
        self.state = State::Closed;
        self.inbuf.clear();
        let flushed = if self.outbuf.is_bound() {
            self.outbuf.flush()
        } else {
            Ok(())
        };
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Write);
            let _ = socket.shutdown(Shutdown::Read);
        }
        drop(self.inbuf.unbind());
        drop(self.outbuf.unbind());
        flushed
    }

    /// Abort the connection without flushing or half-closing.
    ///
    /// For error-recovery paths where the connection is known unusable.
    pub fn shutdown(&mut self) {
        debug!("shutting down connection {}", self);
        self.state = State::Closed;
        if let Some(socket) = self.socket.take() {
            let _ = socket.shutdown(Shutdown::Both);
        }
        drop(self.inbuf.unbind());
        drop(self.outbuf.unbind());
    }

    /// Read timeout currently configured on the socket.
    ///
    /// A socket that cannot be queried reports
    /// [`SocketTimeout::Unknown`] rather than an error; that case is not
    /// actionable by the caller.
    pub fn socket_timeout(&self) -> SocketTimeout {
        match &self.socket {
            Some(socket) => match socket.read_timeout() {
                Ok(None) => SocketTimeout::Off,
                Ok(Some(timeout)) => SocketTimeout::After(timeout),
                Err(_) => SocketTimeout::Unknown,
            },
            None => SocketTimeout::Unknown,
        }
    }

    /// Set the socket read timeout. Errors from a dead socket are ignored.
    pub fn set_socket_timeout(&mut self, timeout: Option<Duration>) {
        if let Some(socket) = &self.socket {
            let _ = socket.set_read_timeout(timeout);
        }
    }

    /// Local endpoint, once bound
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Remote endpoint, once bound
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.socket.as_ref().and_then(|s| s.peer_addr().ok())
    }

    /// Record one request sent or received on this connection
    pub fn count_request(&mut self) {
        self.request_count += 1;
    }

    /// Record one response sent or received on this connection
    pub fn count_response(&mut self) {
        self.response_count += 1;
    }

    /// Snapshot of the connection's transfer counters
    pub fn metrics(&self) -> ConnectionMetrics {
        ConnectionMetrics::new(
            self.outbuf.metrics().bytes_transferred(),
            self.inbuf.metrics().bytes_transferred(),
            self.request_count,
            self.response_count,
        )
    }
}

impl Default for Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.local_addr(), self.peer_addr()) {
            (Some(local), Some(peer)) => write!(f, "{}<->{}", local, peer),
            _ => write!(f, "[not bound]"),
        }
    }
}
