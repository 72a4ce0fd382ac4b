//! Chunked delivery of encoded frames to the HTTP transport.
//!
//! Everything the pipeline emits goes through a [`ChunkSink`] in pieces of at
//! most [`CHUNK_SIZE`] bytes. Stream parts are framed with the multipart
//! boundary and a part header carrying the exact JPEG length.

use std::io;

use actix_web::web::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::mpsc;

/// Largest piece handed to the transport at once.
pub const CHUNK_SIZE: usize = 16 * 1024;

pub const PART_BOUNDARY: &str = "123456789000000000000987654321";
pub const STREAM_CONTENT_TYPE: &str =
    "multipart/x-mixed-replace;boundary=123456789000000000000987654321";
/// Written before every part, including the first.
pub const STREAM_BOUNDARY: &str = "\r\n--123456789000000000000987654321\r\n";

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("client disconnected")]
pub struct SinkClosed;

/// Receiver of response body chunks.
pub trait ChunkSink {
    fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed>;
}

/// Feeds a streaming response body from a worker thread. Blocks while the
/// channel is full; fails once the response side has been dropped.
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

impl ChunkSink for ChannelSink {
    fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.tx.blocking_send(chunk).map_err(|_| SinkClosed)
    }
}

/// Buffers the whole body, for responses that need headers computed after
/// the frame has been captured.
#[derive(Debug, Default)]
pub struct CollectSink {
    body: BytesMut,
    chunks: usize,
}

impl CollectSink {
    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn into_bytes(self) -> Bytes {
        self.body.freeze()
    }
}

impl ChunkSink for CollectSink {
    fn send(&mut self, chunk: Bytes) -> Result<(), SinkClosed> {
        self.chunks += 1;
        self.body.extend_from_slice(&chunk);
        Ok(())
    }
}

/// `io::Write` adapter that coalesces writes into [`CHUNK_SIZE`] pieces, so an
/// encoder can stream straight into a sink.
pub struct ChunkedWriter<'a, S: ChunkSink + ?Sized> {
    sink: &'a mut S,
    pending: BytesMut,
    written: usize,
    closed: bool,
}

impl<'a, S: ChunkSink + ?Sized> ChunkedWriter<'a, S> {
    pub fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            pending: BytesMut::with_capacity(CHUNK_SIZE),
            written: 0,
            closed: false,
        }
    }

    /// Whether a write failed because the sink went away.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush the tail and return the total bytes accepted.
    pub fn finish(mut self) -> Result<usize, SinkClosed> {
        self.emit()?;
        Ok(self.written)
    }

    fn emit(&mut self) -> Result<(), SinkClosed> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let chunk = self.pending.split().freeze();
        self.sink.send(chunk).inspect_err(|_| self.closed = true)
    }
}

impl<S: ChunkSink + ?Sized> io::Write for ChunkedWriter<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut rest = buf;
        while !rest.is_empty() {
            let take = (CHUNK_SIZE - self.pending.len()).min(rest.len());
            self.pending.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.pending.len() == CHUNK_SIZE {
                self.emit().map_err(io::Error::other)?;
            }
        }
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit().map_err(io::Error::other)
    }
}

/// `<seconds>.<microseconds>` as used by `X-Timestamp`.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    format!(
        "{}.{:06}",
        timestamp.timestamp(),
        timestamp.timestamp_subsec_micros()
    )
}

pub fn part_header(len: usize, timestamp: Option<DateTime<Utc>>) -> String {
    match timestamp {
        Some(ts) => format!(
            "Content-Type: image/jpeg\r\nContent-Length: {len}\r\nX-Timestamp: {}\r\n\r\n",
            format_timestamp(ts)
        ),
        None => format!("Content-Type: image/jpeg\r\nContent-Length: {len}\r\n\r\n"),
    }
}

/// Send `body` in [`CHUNK_SIZE`] pieces. Returns bytes written.
pub fn write_body<S: ChunkSink + ?Sized>(sink: &mut S, body: &[u8]) -> Result<usize, SinkClosed> {
    for piece in body.chunks(CHUNK_SIZE) {
        sink.send(Bytes::copy_from_slice(piece))?;
    }
    Ok(body.len())
}

/// Boundary, part header, then the JPEG itself. Returns the JPEG length.
pub fn write_part<S: ChunkSink + ?Sized>(
    sink: &mut S,
    jpeg: &[u8],
    timestamp: Option<DateTime<Utc>>,
) -> Result<usize, SinkClosed> {
    sink.send(Bytes::from_static(STREAM_BOUNDARY.as_bytes()))?;
    sink.send(Bytes::from(part_header(jpeg.len(), timestamp)))?;
    write_body(sink, jpeg)
}
