//! Per-job output buffer.
//!
//! Append-only and single-writer. Readers hold their own cursor (the sequence
//! number of the next chunk they want), so any number of pollers and streams
//! can consume the same buffer without affecting each other.

use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::CoreError;

/// Which stream a chunk came from.
///
/// A pty only has one output stream, and job lines merge stderr into it
/// before framing, so every chunk is tagged `pty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Pty,
}

#[derive(Debug, Clone)]
pub struct Chunk {
    pub seq: u64,
    pub stream: OutputStream,
    pub at: SystemTime,
    pub data: Bytes,
}

#[derive(Default)]
struct BufferInner {
    chunks: Vec<Chunk>,
    total_bytes: usize,
    closed: bool,
}

/// Shared handle to one job's output. Cloning shares the underlying buffer.
#[derive(Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<RwLock<BufferInner>>,
}

impl std::fmt::Debug for OutputBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OutputBuffer")
            .field("chunks", &inner.chunks.len())
            .field("bytes", &inner.total_bytes)
            .field("closed", &inner.closed)
            .finish()
    }
}

impl OutputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return its sequence number.
    ///
    /// Sequence numbers start at 0 and increase by one per chunk.
    pub fn append(&self, stream: OutputStream, data: Bytes) -> Result<u64, CoreError> {
        let mut inner = self.inner.write();
        if inner.closed {
            return Err(CoreError::BufferClosed);
        }
        let seq = inner.chunks.len() as u64;
        inner.total_bytes += data.len();
        inner.chunks.push(Chunk {
            seq,
            stream,
            at: SystemTime::now(),
            data,
        });
        Ok(seq)
    }

    /// Every chunk with `seq >= cursor`, plus the cursor to pass next time.
    ///
    /// Does not modify the buffer; calling twice with the same cursor on an
    /// unchanged buffer yields the same result.
    pub fn read_since(&self, cursor: u64) -> (Vec<Chunk>, u64) {
        let inner = self.inner.read();
        let end = inner.chunks.len() as u64;
        if cursor >= end {
            return (Vec::new(), cursor);
        }
        let chunks = inner.chunks[cursor as usize..].to_vec();
        (chunks, end)
    }

    /// Mark the buffer complete. Further appends fail with `BufferClosed`.
    ///
    /// Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        let mut inner = self.inner.write();
        !std::mem::replace(&mut inner.closed, true)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.read().closed
    }

    pub fn len(&self) -> usize {
        self.inner.read().chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.read().total_bytes
    }

    /// All output concatenated.
    pub fn contents(&self) -> Vec<u8> {
        let inner = self.inner.read();
        let mut out = Vec::with_capacity(inner.total_bytes);
        for chunk in &inner.chunks {
            out.extend_from_slice(&chunk.data);
        }
        out
    }

    /// The last `max_bytes` of output as lossy UTF-8, never starting in the
    /// middle of a multi-byte character.
    pub fn tail_string(&self, max_bytes: usize) -> String {
        let data = self.contents();
        if data.len() <= max_bytes {
            return String::from_utf8_lossy(&data).into_owned();
        }
        let keep_from = data.len() - max_bytes;
        // Skip UTF-8 continuation bytes (0b10xxxxxx).
        let start = (keep_from..data.len())
            .find(|&i| (data[i] as i8) >= -64)
            .unwrap_or(data.len());
        String::from_utf8_lossy(&data[start..]).into_owned()
    }
}
