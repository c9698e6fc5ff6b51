//! Chunking: split an outbound file into fixed 1 KiB blocks and build its FILE/CHUNK/END frames.

use std::io::{self, Read};

use crate::integrity::StreamingDigest;
use crate::protocol::{chunk_correlation_id, end_correlation_id, Frame};

/// Chunk size in bytes. The protocol supports no other size.
pub const CHUNK_SIZE: usize = 1024;

/// Byte offset of a 1-based sequence number.
pub fn chunk_offset(seq: u32) -> u64 {
    u64::from(seq.saturating_sub(1)) * CHUNK_SIZE as u64
}

/// Number of chunks a file of `size` bytes is split into.
pub fn chunk_count(size: u64) -> u64 {
    size.div_ceil(CHUNK_SIZE as u64)
}

/// A frame plus the correlation id its acknowledgment will carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedFrame {
    pub correlation_id: String,
    pub frame: Frame,
}

/// Reads `CHUNK_SIZE` blocks with 1-based sequence numbers, digesting as it goes.
pub struct ChunkReader<R> {
    inner: R,
    next_seq: u32,
    bytes_read: u64,
    digest: StreamingDigest,
}

impl<R: Read> ChunkReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            next_seq: 1,
            bytes_read: 0,
            digest: StreamingDigest::new(),
        }
    }

    /// Next `(seq, block)`. Every block is full except possibly the last.
    pub fn next_chunk(&mut self) -> io::Result<Option<(u32, Vec<u8>)>> {
        let mut block = vec![0u8; CHUNK_SIZE];
        let mut filled = 0;
        while filled < CHUNK_SIZE {
            match self.inner.read(&mut block[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        block.truncate(filled);
        self.digest.update(&block);
        self.bytes_read += filled as u64;
        let seq = self.next_seq;
        self.next_seq += 1;
        Ok(Some((seq, block)))
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    /// Hex digest of everything read so far.
    pub fn finish(self) -> String {
        self.digest.finish_hex()
    }
}

/// Build the complete frame sequence for one outbound file: FILE, CHUNK 1..n, END.
/// The announced size is the number of bytes actually read.
pub fn plan_file_frames<R: Read>(
    transfer_id: &str,
    file_name: &str,
    reader: R,
) -> io::Result<Vec<TrackedFrame>> {
    let mut chunks = ChunkReader::new(reader);
    let mut body = Vec::new();
    while let Some((seq, payload)) = chunks.next_chunk()? {
        body.push(TrackedFrame {
            correlation_id: chunk_correlation_id(transfer_id, seq),
            frame: Frame::Chunk {
                id: transfer_id.to_string(),
                seq,
                payload,
            },
        });
    }
    let size = chunks.bytes_read();
    let digest = chunks.finish();

    let mut frames = Vec::with_capacity(body.len() + 2);
    frames.push(TrackedFrame {
        correlation_id: transfer_id.to_string(),
        frame: Frame::File {
            id: transfer_id.to_string(),
            file_name: file_name.to_string(),
            size,
        },
    });
    frames.extend(body);
    frames.push(TrackedFrame {
        correlation_id: end_correlation_id(transfer_id),
        frame: Frame::End {
            id: transfer_id.to_string(),
            digest,
        },
    });
    Ok(frames)
}
