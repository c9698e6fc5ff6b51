//! lanlink wire protocol: frame kinds, NACK reasons and correlation ids.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

/// Default UDP port shared by every node on the segment.
pub const DEFAULT_PORT: u16 = 9876;

/// Receive buffer size. A frame larger than this is truncated by the transport.
pub const MAX_FRAME_LEN: usize = 8192;

/// All frame kinds. Text encoding is in the wire module; each variant maps to one command word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Presence announcement, broadcast and never acknowledged.
    Heartbeat { name: String },
    /// Point-to-point text message.
    Talk { id: String, text: String },
    /// File announce: opens a transfer of `size` bytes.
    File {
        id: String,
        file_name: String,
        size: u64,
    },
    /// One block of a file. `seq` is 1-based.
    Chunk {
        id: String,
        seq: u32,
        payload: Vec<u8>,
    },
    /// Closes a transfer; `digest` is the hex MD5 of the whole file.
    End { id: String, digest: String },
    Ack { id: String },
    Nack { id: String, reason: NackReason },
}

impl Frame {
    /// Upper-case command word on the wire.
    pub fn command(&self) -> &'static str {
        match self {
            Frame::Heartbeat { .. } => "HEARTBEAT",
            Frame::Talk { .. } => "TALK",
            Frame::File { .. } => "FILE",
            Frame::Chunk { .. } => "CHUNK",
            Frame::End { .. } => "END",
            Frame::Ack { .. } => "ACK",
            Frame::Nack { .. } => "NACK",
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Heartbeat { name } => write!(f, "HEARTBEAT {name}"),
            Frame::Talk { id, text } => write!(f, "TALK {id} {text}"),
            Frame::File {
                id,
                file_name,
                size,
            } => write!(f, "FILE {id} {file_name} {size}"),
            Frame::Chunk { id, seq, payload } => {
                write!(f, "CHUNK {id} {seq} {}", BASE64.encode(payload))
            }
            Frame::End { id, digest } => write!(f, "END {id} {digest}"),
            Frame::Ack { id } => write!(f, "ACK {id}"),
            Frame::Nack { id, reason } => write!(f, "NACK {id} {reason}"),
        }
    }
}

/// Why a receiver rejected a frame. Carried as free text after the id in a NACK.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum NackReason {
    /// Reassembly storage could not be allocated for a FILE announce.
    InitFailed,
    /// CHUNK or END for a transfer that was never announced.
    NotStarted,
    /// END digest does not match the stored bytes.
    HashInvalid,
    /// A chunk could not be written to storage.
    WriteFailed,
    /// Any reason string this node does not know.
    Other(String),
}

impl NackReason {
    pub fn as_str(&self) -> &str {
        match self {
            NackReason::InitFailed => "init-failed",
            NackReason::NotStarted => "not-started",
            NackReason::HashInvalid => "hash-invalid",
            NackReason::WriteFailed => "write-failed",
            NackReason::Other(s) => s,
        }
    }
}

impl From<&str> for NackReason {
    fn from(s: &str) -> Self {
        match s {
            "init-failed" => NackReason::InitFailed,
            "not-started" => NackReason::NotStarted,
            "hash-invalid" => NackReason::HashInvalid,
            "write-failed" => NackReason::WriteFailed,
            other => NackReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

const SEQ_MARKER: &str = "-seq";
const END_SUFFIX: &str = "-end";

/// Correlation id under which CHUNK `seq` of a transfer is tracked and acknowledged.
pub fn chunk_correlation_id(transfer_id: &str, seq: u32) -> String {
    format!("{transfer_id}{SEQ_MARKER}{seq}")
}

/// Correlation id under which the END frame of a transfer is tracked and acknowledged.
pub fn end_correlation_id(transfer_id: &str) -> String {
    format!("{transfer_id}{END_SUFFIX}")
}

/// If `correlation_id` names an END frame, the transfer it closes.
pub fn end_transfer_id(correlation_id: &str) -> Option<&str> {
    correlation_id
        .strip_suffix(END_SUFFIX)
        .filter(|base| !base.is_empty())
}

/// Transfer id that owns a correlation id. Plain ids (TALK, FILE) own themselves.
pub fn owning_transfer(correlation_id: &str) -> &str {
    if let Some(base) = end_transfer_id(correlation_id) {
        return base;
    }
    if let Some(pos) = correlation_id.rfind(SEQ_MARKER) {
        let digits = &correlation_id[pos + SEQ_MARKER.len()..];
        if pos > 0 && !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()) {
            return &correlation_id[..pos];
        }
    }
    correlation_id
}
