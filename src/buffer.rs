//! Session buffers
//!
//! Buffered adapters between the raw transport streams and message-level
//! read/write operations. These are the only components that touch the raw
//! streams directly; every byte crossing a stream is counted in the
//! buffer's transport metrics.
//!
//! Header lines and start-lines go through the text seam
//! ([`SessionInputBuffer::read_line`] / [`SessionOutputBuffer::write_line`]);
//! body bytes pass through as raw octets so encodings never corrupt binary
//! payloads.

use crate::metrics::TransportMetrics;
use crate::{Error, Result, CRLF};
use bytes::{Buf, BytesMut};
use std::io::{Read, Write};

/// Buffered reader over a raw input stream.
///
/// Created unbound; [`bind`](Self::bind) attaches the stream exactly once.
/// Each fill performs a single blocking read of at most the configured
/// capacity.
pub struct SessionInputBuffer<R: Read> {
    stream: Option<R>,
    buf: BytesMut,
    capacity: usize,
    metrics: TransportMetrics,
}

impl<R: Read> SessionInputBuffer<R> {
    /// Create a new unbound input buffer
    pub fn new(capacity: usize) -> Self {
        SessionInputBuffer {
            stream: None,
            buf: BytesMut::with_capacity(capacity),
            capacity: capacity.max(1),
            metrics: TransportMetrics::new(),
        }
    }

    /// Attach the raw stream. A buffer can be bound exactly once.
    pub fn bind(&mut self, stream: R) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyBound);
        }
        self.stream = Some(stream);
        Ok(())
    }

    /// Whether a stream has been attached
    pub fn is_bound(&self) -> bool {
        self.stream.is_some()
    }

    /// Detach and return the raw stream, leaving the buffer unusable.
    pub(crate) fn unbind(&mut self) -> Option<R> {
        self.stream.take()
    }

    /// Transport metrics for this direction
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// Whether unread bytes remain buffered. Performs no I/O.
    pub fn has_buffered_data(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Discard buffered-but-unread bytes
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// One blocking read from the raw stream into the buffer.
    ///
    /// Returns the number of bytes read; 0 means the peer closed its side.
    /// A read timeout configured on the underlying socket surfaces as
    /// [`Error::Timeout`], never as a generic I/O error.
    pub fn fill_buffer(&mut self) -> Result<usize> {
        let stream = self.stream.as_mut().ok_or(Error::Unbound)?;
        let start = self.buf.len();
        self.buf.resize(start + self.capacity, 0);
        match stream.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                self.metrics.add(n as u64);
                Ok(n)
            }
            Err(err) => {
                self.buf.truncate(start);
                Err(Error::from_io(err))
            }
        }
    }

    /// Read buffered bytes, refilling from the raw stream when empty.
    ///
    /// Returns 0 only at end of stream.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        if self.buf.is_empty() && self.fill_buffer()? == 0 {
            return Ok(0);
        }
        let n = dst.len().min(self.buf.len());
        dst[..n].copy_from_slice(&self.buf[..n]);
        self.buf.advance(n);
        Ok(n)
    }

    /// Read one text line, consuming through the terminating LF.
    ///
    /// The returned line has its CRLF (or bare LF) stripped and is decoded
    /// as UTF-8, lossily; header lines are ASCII in practice. Returns
    /// `Ok(None)` on a clean end of stream before any byte of a line; a
    /// final unterminated line is returned as-is.
    pub fn read_line(&mut self) -> Result<Option<String>> {
        let mut line: Vec<u8> = Vec::new();
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&self.buf[..pos]);
                self.buf.advance(pos + 1);
                break;
            }
            line.extend_from_slice(&self.buf);
            self.buf.clear();
            if self.fill_buffer()? == 0 {
                if line.is_empty() {
                    return Ok(None);
                }
                break;
            }
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(Some(String::from_utf8_lossy(&line).into_owned()))
    }
}

/// Buffered writer over a raw output stream.
///
/// Bytes accumulate in the buffer and spill to the stream when it fills;
/// writes larger than the capacity bypass the buffer after draining any
/// pending bytes, preserving order.
pub struct SessionOutputBuffer<W: Write> {
    stream: Option<W>,
    buf: BytesMut,
    capacity: usize,
    metrics: TransportMetrics,
}

impl<W: Write> SessionOutputBuffer<W> {
    /// Create a new unbound output buffer
    pub fn new(capacity: usize) -> Self {
        SessionOutputBuffer {
            stream: None,
            buf: BytesMut::with_capacity(capacity),
            capacity: capacity.max(1),
            metrics: TransportMetrics::new(),
        }
    }

    /// Attach the raw stream. A buffer can be bound exactly once.
    pub fn bind(&mut self, stream: W) -> Result<()> {
        if self.stream.is_some() {
            return Err(Error::AlreadyBound);
        }
        self.stream = Some(stream);
        Ok(())
    }

    /// Whether a stream has been attached
    pub fn is_bound(&self) -> bool {
        self.stream.is_some()
    }

    /// Detach and return the raw stream, leaving the buffer unusable.
    pub(crate) fn unbind(&mut self) -> Option<W> {
        self.stream.take()
    }

    /// Transport metrics for this direction
    pub fn metrics(&self) -> &TransportMetrics {
        &self.metrics
    }

    /// Whether bytes are waiting to be flushed
    pub fn has_buffered_data(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Get a reference to the underlying stream
    pub fn get_ref(&self) -> Option<&W> {
        self.stream.as_ref()
    }

    /// Append bytes, spilling to the raw stream when the buffer fills.
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if self.stream.is_none() {
            return Err(Error::Unbound);
        }
        if src.is_empty() {
            return Ok(0);
        }
        if src.len() > self.capacity {
            self.flush_buffer()?;
            self.write_stream(src)?;
            return Ok(src.len());
        }
        if self.buf.len() + src.len() > self.capacity {
            self.flush_buffer()?;
        }
        self.buf.extend_from_slice(src);
        Ok(src.len())
    }

    /// Write a header line followed by CRLF
    pub fn write_line(&mut self, line: &str) -> Result<()> {
        self.write(line.as_bytes())?;
        self.write(CRLF.as_bytes())?;
        Ok(())
    }

    /// Push buffered bytes to the raw stream and flush it.
    ///
    /// Failures surface to the caller; the buffer performs no retry.
    pub fn flush(&mut self) -> Result<()> {
        self.flush_buffer()?;
        let stream = self.stream.as_mut().ok_or(Error::Unbound)?;
        stream.flush().map_err(Error::from_io)
    }

    fn flush_buffer(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let pending = self.buf.split();
        self.write_stream(&pending)
    }

    fn write_stream(&mut self, src: &[u8]) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::Unbound)?;
        let mut written = 0;
        while written < src.len() {
            let n = stream.write(&src[written..]).map_err(Error::from_io)?;
            if n == 0 {
                return Err(Error::ConnectionClosed);
            }
            written += n;
            self.metrics.add(n as u64);
        }
        Ok(())
    }
}
