//! Body streams
//!
//! Readers and writers scoped to exactly one message body. Each variant
//! consumes or emits precisely the framed bytes of its message, so the next
//! message's start-line begins at the following byte on a reused
//! connection.
//!
//! A body stream holds an exclusive borrow of its session buffer; it cannot
//! outlive the message exchange it was created for.

use crate::buffer::{SessionInputBuffer, SessionOutputBuffer};
use crate::strategy::BodyLength;
use crate::{Error, Result};
use bytes::BytesMut;
use std::io::{Read, Write};

/// Default chunk cache size for chunked body writers
pub const DEFAULT_CHUNK_CACHE: usize = 2048;

/// Reader over exactly one message body.
pub enum BodyReader<'a, R: Read> {
    Chunked(ChunkedReader<'a, R>),
    Identity(IdentityReader<'a, R>),
    Fixed(FixedLengthReader<'a, R>),
}

impl<'a, R: Read> BodyReader<'a, R> {
    /// Build the reader matching a framing decision.
    pub fn new(len: BodyLength, buffer: &'a mut SessionInputBuffer<R>) -> Self {
        match len {
            BodyLength::Chunked => BodyReader::Chunked(ChunkedReader::new(buffer)),
            BodyLength::Identity => BodyReader::Identity(IdentityReader::new(buffer)),
            BodyLength::Fixed(n) => BodyReader::Fixed(FixedLengthReader::new(buffer, n)),
        }
    }

    /// Read body bytes. Returns 0 exactly when the body is complete.
    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        match self {
            BodyReader::Chunked(r) => r.read(dst),
            BodyReader::Identity(r) => r.read(dst),
            BodyReader::Fixed(r) => r.read(dst),
        }
    }

    /// Whether the body has been fully consumed
    pub fn is_complete(&self) -> bool {
        match self {
            BodyReader::Chunked(r) => r.is_complete(),
            BodyReader::Identity(r) => r.is_complete(),
            BodyReader::Fixed(r) => r.is_complete(),
        }
    }

    /// Trailer lines received after a chunked body, verbatim
    pub fn trailers(&self) -> &[String] {
        match self {
            BodyReader::Chunked(r) => r.trailers(),
            _ => &[],
        }
    }

    /// Read and discard the rest of the body, returning the bytes skipped.
    ///
    /// A body must be fully consumed before the next message is read on the
    /// same connection; this is the cheap way to guarantee that.
    pub fn drain(&mut self) -> Result<u64> {
        let mut scratch = [0u8; 1024];
        let mut skipped = 0u64;
        loop {
            let n = self.read(&mut scratch)?;
            if n == 0 {
                return Ok(skipped);
            }
            skipped += n as u64;
        }
    }
}

/// Decoder for the chunked transfer-coding.
///
/// Wire format: `hex-size [;ext] CRLF data CRLF`, terminated by a zero-size
/// chunk optionally followed by trailer lines and a closing blank line.
pub struct ChunkedReader<'a, R: Read> {
    buffer: &'a mut SessionInputBuffer<R>,
    state: ChunkState,
    remaining: u64,
    trailers: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ChunkState {
    Size,
    Data,
    DataEnd,
    Done,
}

impl<'a, R: Read> ChunkedReader<'a, R> {
    pub fn new(buffer: &'a mut SessionInputBuffer<R>) -> Self {
        ChunkedReader {
            buffer,
            state: ChunkState::Size,
            remaining: 0,
            trailers: Vec::new(),
        }
    }

    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if dst.is_empty() {
            return Ok(0);
        }
        loop {
            match self.state {
                ChunkState::Done => return Ok(0),
                ChunkState::Size => {
                    let size = self.read_chunk_size()?;
                    if size == 0 {
                        self.read_trailers()?;
                        self.state = ChunkState::Done;
                        return Ok(0);
                    }
                    self.remaining = size;
                    self.state = ChunkState::Data;
                }
                ChunkState::Data => {
                    let want = dst.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
                    let n = self.buffer.read(&mut dst[..want])?;
                    if n == 0 {
                        return Err(Error::ConnectionClosed);
                    }
                    self.remaining -= n as u64;
                    if self.remaining == 0 {
                        self.state = ChunkState::DataEnd;
                    }
                    return Ok(n);
                }
                ChunkState::DataEnd => match self.buffer.read_line()? {
                    Some(line) if line.is_empty() => self.state = ChunkState::Size,
                    Some(_) => {
                        return Err(Error::Protocol(
                            "missing CRLF after chunk data".to_string(),
                        ))
                    }
                    None => return Err(Error::ConnectionClosed),
                },
            }
        }
    }

    fn read_chunk_size(&mut self) -> Result<u64> {
        let line = self.buffer.read_line()?.ok_or(Error::ConnectionClosed)?;
        // Chunk extensions after a semicolon are ignored
        let size = line.split(';').next().unwrap().trim();
        u64::from_str_radix(size, 16).map_err(|_| Error::InvalidChunkSize(size.to_string()))
    }

    fn read_trailers(&mut self) -> Result<()> {
        loop {
            match self.buffer.read_line()? {
                None => return Err(Error::ConnectionClosed),
                Some(line) if line.is_empty() => return Ok(()),
                Some(line) => self.trailers.push(line),
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ChunkState::Done
    }

    pub fn trailers(&self) -> &[String] {
        &self.trailers
    }
}

/// Pass-through reader bounded only by transport end-of-stream.
pub struct IdentityReader<'a, R: Read> {
    buffer: &'a mut SessionInputBuffer<R>,
    eof: bool,
}

impl<'a, R: Read> IdentityReader<'a, R> {
    pub fn new(buffer: &'a mut SessionInputBuffer<R>) -> Self {
        IdentityReader { buffer, eof: false }
    }

    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if self.eof || dst.is_empty() {
            return Ok(0);
        }
        let n = self.buffer.read(dst)?;
        if n == 0 {
            self.eof = true;
        }
        Ok(n)
    }

    pub fn is_complete(&self) -> bool {
        self.eof
    }
}

/// Reader that yields exactly the declared number of bytes.
///
/// Logical EOF is reported once the count is exhausted regardless of how
/// much more the underlying stream has buffered, isolating this message's
/// body from the next message's bytes.
pub struct FixedLengthReader<'a, R: Read> {
    buffer: &'a mut SessionInputBuffer<R>,
    remaining: u64,
}

impl<'a, R: Read> FixedLengthReader<'a, R> {
    pub fn new(buffer: &'a mut SessionInputBuffer<R>, len: u64) -> Self {
        FixedLengthReader {
            buffer,
            remaining: len,
        }
    }

    pub fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if self.remaining == 0 || dst.is_empty() {
            return Ok(0);
        }
        let want = dst.len().min(usize::try_from(self.remaining).unwrap_or(usize::MAX));
        let n = self.buffer.read(&mut dst[..want])?;
        if n == 0 {
            // transport closed before the declared length arrived
            return Err(Error::ConnectionClosed);
        }
        self.remaining -= n as u64;
        Ok(n)
    }

    /// Bytes of the declared length not yet read
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Writer over exactly one message body.
pub enum BodyWriter<'a, W: Write> {
    Chunked(ChunkedWriter<'a, W>),
    Identity(IdentityWriter<'a, W>),
    Fixed(FixedLengthWriter<'a, W>),
}

impl<'a, W: Write> BodyWriter<'a, W> {
    /// Build the writer matching a framing decision.
    pub fn new(len: BodyLength, buffer: &'a mut SessionOutputBuffer<W>) -> Self {
        match len {
            BodyLength::Chunked => BodyWriter::Chunked(ChunkedWriter::new(buffer)),
            BodyLength::Identity => BodyWriter::Identity(IdentityWriter::new(buffer)),
            BodyLength::Fixed(n) => BodyWriter::Fixed(FixedLengthWriter::new(buffer, n)),
        }
    }

    /// Write body bytes
    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        match self {
            BodyWriter::Chunked(w) => w.write(src),
            BodyWriter::Identity(w) => w.write(src),
            BodyWriter::Fixed(w) => w.write(src),
        }
    }

    /// Complete the body encoding.
    ///
    /// For chunked bodies this emits the terminating zero chunk; for
    /// fixed-length bodies it verifies the declared length was written.
    pub fn finish(&mut self) -> Result<()> {
        match self {
            BodyWriter::Chunked(w) => w.finish(),
            BodyWriter::Identity(w) => w.finish(),
            BodyWriter::Fixed(w) => w.finish(),
        }
    }
}

fn emit_chunk<W: Write>(
    buffer: &mut SessionOutputBuffer<W>,
    head: &[u8],
    tail: &[u8],
) -> Result<()> {
    let size = head.len() + tail.len();
    if size == 0 {
        return Ok(());
    }
    buffer.write_line(&format!("{:x}", size))?;
    if !head.is_empty() {
        buffer.write(head)?;
    }
    if !tail.is_empty() {
        buffer.write(tail)?;
    }
    buffer.write_line("")?;
    Ok(())
}

/// Encoder for the chunked transfer-coding.
///
/// Entity bytes accumulate in a fixed-size cache; each full cache is
/// emitted as one chunk. [`finish`](Self::finish) flushes the pending
/// partial chunk and writes the zero-chunk terminator exactly once.
pub struct ChunkedWriter<'a, W: Write> {
    buffer: &'a mut SessionOutputBuffer<W>,
    cache: BytesMut,
    cache_size: usize,
    finished: bool,
}

impl<'a, W: Write> ChunkedWriter<'a, W> {
    pub fn new(buffer: &'a mut SessionOutputBuffer<W>) -> Self {
        Self::with_cache_size(buffer, DEFAULT_CHUNK_CACHE)
    }

    pub fn with_cache_size(buffer: &'a mut SessionOutputBuffer<W>, cache_size: usize) -> Self {
        ChunkedWriter {
            buffer,
            cache: BytesMut::with_capacity(cache_size),
            cache_size: cache_size.max(1),
            finished: false,
        }
    }

    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if self.finished {
            return Err(Error::Protocol("write after body finished".to_string()));
        }
        if src.is_empty() {
            return Ok(0);
        }
        if self.cache.len() + src.len() >= self.cache_size {
            emit_chunk(self.buffer, &self.cache, src)?;
            self.cache.clear();
        } else {
            self.cache.extend_from_slice(src);
        }
        Ok(src.len())
    }

    /// Flush the pending partial chunk and write the terminating zero chunk.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        emit_chunk(self.buffer, &self.cache, &[])?;
        self.cache.clear();
        self.buffer.write_line("0")?;
        self.buffer.write_line("")?;
        self.finished = true;
        Ok(())
    }
}

/// Pass-through writer; inserts no delimiters.
pub struct IdentityWriter<'a, W: Write> {
    buffer: &'a mut SessionOutputBuffer<W>,
    finished: bool,
}

impl<'a, W: Write> IdentityWriter<'a, W> {
    pub fn new(buffer: &'a mut SessionOutputBuffer<W>) -> Self {
        IdentityWriter {
            buffer,
            finished: false,
        }
    }

    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if self.finished {
            return Err(Error::Protocol("write after body finished".to_string()));
        }
        self.buffer.write(src)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}

/// Writer that accepts exactly the declared number of bytes.
pub struct FixedLengthWriter<'a, W: Write> {
    buffer: &'a mut SessionOutputBuffer<W>,
    remaining: u64,
    finished: bool,
}

impl<'a, W: Write> FixedLengthWriter<'a, W> {
    pub fn new(buffer: &'a mut SessionOutputBuffer<W>, len: u64) -> Self {
        FixedLengthWriter {
            buffer,
            remaining: len,
            finished: false,
        }
    }

    pub fn write(&mut self, src: &[u8]) -> Result<usize> {
        if self.finished {
            return Err(Error::Protocol("write after body finished".to_string()));
        }
        if src.is_empty() {
            return Ok(0);
        }
        if src.len() as u64 > self.remaining {
            return Err(Error::Protocol(format!(
                "body length exceeded by {} bytes",
                src.len() as u64 - self.remaining
            )));
        }
        self.buffer.write(src)?;
        self.remaining -= src.len() as u64;
        Ok(src.len())
    }

    /// Bytes of the declared length not yet written
    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if self.remaining != 0 {
            return Err(Error::Protocol(format!(
                "{} bytes of declared body length unwritten",
                self.remaining
            )));
        }
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(data: &[u8]) -> SessionInputBuffer<&[u8]> {
        let mut buffer = SessionInputBuffer::new(4096);
        buffer.bind(data).unwrap();
        buffer
    }

    fn output() -> SessionOutputBuffer<Vec<u8>> {
        let mut buffer = SessionOutputBuffer::new(4096);
        buffer.bind(Vec::new()).unwrap();
        buffer
    }

    fn read_all(reader: &mut BodyReader<'_, &[u8]>) -> Vec<u8> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 7];
        loop {
            let n = reader.read(&mut chunk).unwrap();
            if n == 0 {
                return out;
            }
            out.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_chunked_decode_single_chunk() {
        let mut buffer = input(b"5\r\nHello\r\n0\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        assert_eq!(read_all(&mut reader), b"Hello");
        assert!(reader.is_complete());
    }

    #[test]
    fn test_chunked_decode_multiple_chunks() {
        let mut buffer = input(b"5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        assert_eq!(read_all(&mut reader), b"Hello World");
    }

    #[test]
    fn test_chunked_decode_empty_body() {
        let mut buffer = input(b"0\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        assert_eq!(read_all(&mut reader), b"");
        assert!(reader.is_complete());
    }

    #[test]
    fn test_chunked_decode_ignores_extensions() {
        let mut buffer = input(b"5;ext=value\r\nHello\r\n0\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        assert_eq!(read_all(&mut reader), b"Hello");
    }

    #[test]
    fn test_chunked_decode_surfaces_trailers() {
        let mut buffer = input(b"5\r\nHello\r\n0\r\nVary: *\r\nX-Extra: 1\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        assert_eq!(read_all(&mut reader), b"Hello");
        assert_eq!(reader.trailers().to_vec(), vec!["Vary: *", "X-Extra: 1"]);
    }

    #[test]
    fn test_chunked_decode_rejects_bad_size_line() {
        let mut buffer = input(b"zz\r\nHello\r\n0\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        let mut dst = [0u8; 8];
        assert!(matches!(
            reader.read(&mut dst),
            Err(Error::InvalidChunkSize(_))
        ));
    }

    #[test]
    fn test_chunked_decode_rejects_missing_crlf() {
        let mut buffer = input(b"5\r\nHelloX0\r\n\r\n");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        let mut dst = [0u8; 5];
        reader.read(&mut dst).unwrap();
        assert!(matches!(reader.read(&mut dst), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_chunked_decode_truncated_body() {
        let mut buffer = input(b"5\r\nHe");
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        let mut dst = [0u8; 8];
        assert_eq!(reader.read(&mut dst).unwrap(), 2);
        assert!(matches!(
            reader.read(&mut dst),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_chunked_leaves_next_message_intact() {
        let mut buffer = input(b"3\r\nabc\r\n0\r\n\r\nHTTP/1.1 200 OK\r\n");
        {
            let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
            assert_eq!(read_all(&mut reader), b"abc");
        }
        assert_eq!(
            buffer.read_line().unwrap().as_deref(),
            Some("HTTP/1.1 200 OK")
        );
    }

    #[test]
    fn test_chunked_encode_single_chunk() {
        let mut buffer = output();
        {
            let mut writer = ChunkedWriter::with_cache_size(&mut buffer, 16);
            writer.write(b"Hello").unwrap();
            writer.finish().unwrap();
        }
        buffer.flush().unwrap();
        assert_eq!(buffer.get_ref().unwrap().as_slice(), b"5\r\nHello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_chunked_encode_splits_on_cache_size() {
        let mut buffer = output();
        {
            let mut writer = ChunkedWriter::with_cache_size(&mut buffer, 4);
            writer.write(b"Hello").unwrap();
            writer.write(b"World").unwrap();
            writer.finish().unwrap();
        }
        buffer.flush().unwrap();
        assert_eq!(
            buffer.get_ref().unwrap().as_slice(),
            b"5\r\nHello\r\n5\r\nWorld\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn test_chunked_encode_small_writes_coalesce() {
        let mut buffer = output();
        {
            let mut writer = ChunkedWriter::with_cache_size(&mut buffer, 64);
            writer.write(b"Hel").unwrap();
            writer.write(b"lo").unwrap();
            writer.finish().unwrap();
        }
        buffer.flush().unwrap();
        assert_eq!(buffer.get_ref().unwrap().as_slice(), b"5\r\nHello\r\n0\r\n\r\n");
    }

    #[test]
    fn test_chunked_encode_finish_is_idempotent() {
        let mut buffer = output();
        {
            let mut writer = ChunkedWriter::new(&mut buffer);
            writer.write(b"x").unwrap();
            writer.finish().unwrap();
            writer.finish().unwrap();
            assert!(writer.write(b"y").is_err());
        }
        buffer.flush().unwrap();
        assert_eq!(buffer.get_ref().unwrap().as_slice(), b"1\r\nx\r\n0\r\n\r\n");
    }

    #[test]
    fn test_chunked_round_trip() {
        let body: Vec<u8> = (0u32..5000).map(|i| (i % 251) as u8).collect();

        let mut out = output();
        {
            let mut writer = ChunkedWriter::with_cache_size(&mut out, 256);
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + 333).min(body.len());
                writer.write(&body[offset..end]).unwrap();
                offset = end;
            }
            writer.finish().unwrap();
        }
        out.flush().unwrap();

        let encoded = out.get_ref().unwrap().clone();
        let mut buffer = input(&encoded);
        let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
        assert_eq!(read_all(&mut reader), body);
    }

    #[test]
    fn test_identity_reads_until_eof() {
        let mut buffer = input(b"anything goes");
        let mut reader = BodyReader::new(BodyLength::Identity, &mut buffer);
        assert!(!reader.is_complete());
        assert_eq!(read_all(&mut reader), b"anything goes");
        assert!(reader.is_complete());
    }

    #[test]
    fn test_identity_writer_passes_through() {
        let mut buffer = output();
        {
            let mut writer = BodyWriter::new(BodyLength::Identity, &mut buffer);
            writer.write(b"raw ").unwrap();
            writer.write(b"bytes").unwrap();
            writer.finish().unwrap();
        }
        buffer.flush().unwrap();
        assert_eq!(buffer.get_ref().unwrap().as_slice(), b"raw bytes");
    }

    #[test]
    fn test_fixed_reader_stops_at_boundary() {
        let mut buffer = input(b"0123456789NEXT");
        {
            let mut reader = BodyReader::new(BodyLength::Fixed(10), &mut buffer);
            assert_eq!(read_all(&mut reader), b"0123456789");
            assert!(reader.is_complete());
        }
        // the following message's bytes were not consumed
        let mut dst = [0u8; 4];
        assert_eq!(buffer.read(&mut dst).unwrap(), 4);
        assert_eq!(&dst, b"NEXT");
    }

    #[test]
    fn test_fixed_reader_zero_length() {
        let mut buffer = input(b"NEXT");
        let mut reader = BodyReader::new(BodyLength::Fixed(0), &mut buffer);
        assert!(reader.is_complete());
        assert_eq!(read_all(&mut reader), b"");
    }

    #[test]
    fn test_fixed_reader_truncated_stream() {
        let mut buffer = input(b"abc");
        let mut reader = BodyReader::new(BodyLength::Fixed(10), &mut buffer);
        let mut dst = [0u8; 10];
        assert_eq!(reader.read(&mut dst).unwrap(), 3);
        assert!(matches!(
            reader.read(&mut dst),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn test_fixed_writer_round_trip() {
        let mut out = output();
        {
            let mut writer = BodyWriter::new(BodyLength::Fixed(5), &mut out);
            writer.write(b"exact").unwrap();
            writer.finish().unwrap();
        }
        out.flush().unwrap();

        let encoded = out.get_ref().unwrap().clone();
        let mut buffer = input(&encoded);
        let mut reader = BodyReader::new(BodyLength::Fixed(5), &mut buffer);
        assert_eq!(read_all(&mut reader), b"exact");
    }

    #[test]
    fn test_fixed_writer_refuses_excess() {
        let mut buffer = output();
        let mut writer = BodyWriter::new(BodyLength::Fixed(5), &mut buffer);
        writer.write(b"exact").unwrap();
        assert!(matches!(writer.write(b"!"), Err(Error::Protocol(_))));
        writer.finish().unwrap();
    }

    #[test]
    fn test_fixed_writer_rejects_short_body() {
        let mut buffer = output();
        let mut writer = BodyWriter::new(BodyLength::Fixed(5), &mut buffer);
        writer.write(b"ab").unwrap();
        assert!(matches!(writer.finish(), Err(Error::Protocol(_))));
    }

    #[test]
    fn test_drain_skips_rest_of_body() {
        let mut buffer = input(b"5\r\nHello\r\n0\r\n\r\nnext");
        {
            let mut reader = BodyReader::new(BodyLength::Chunked, &mut buffer);
            assert_eq!(reader.drain().unwrap(), 5);
            assert!(reader.is_complete());
        }
        let mut dst = [0u8; 4];
        assert_eq!(buffer.read(&mut dst).unwrap(), 4);
        assert_eq!(&dst, b"next");
    }
}
