//! Framing: one UTF-8 text line per datagram, `<COMMAND> <args...>`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::protocol::{Frame, NackReason, MAX_FRAME_LEN};

/// Encode a frame into datagram bytes.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    frame.to_string().into_bytes()
}

/// Error decoding a datagram into a frame.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("frame too large ({0} bytes)")]
    TooLarge(usize),
    #[error("frame is not valid UTF-8")]
    NotUtf8,
    #[error("empty frame")]
    Empty,
    /// Command word this node does not know. Ignored for forward compatibility.
    #[error("unknown command {0:?}")]
    Unknown(String),
    /// Known command with missing or unparsable arguments.
    #[error("malformed {command} frame: {reason}")]
    Malformed {
        command: &'static str,
        reason: &'static str,
    },
}

/// Decode one datagram. The command word is matched case-insensitively; arguments keep their case.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, FrameDecodeError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameDecodeError::TooLarge(bytes.len()));
    }
    let text = std::str::from_utf8(bytes).map_err(|_| FrameDecodeError::NotUtf8)?;
    let text = text.trim_end_matches(['\r', '\n']);
    if text.trim().is_empty() {
        return Err(FrameDecodeError::Empty);
    }
    let (command, rest) = match text.split_once(' ') {
        Some((c, r)) => (c, Some(r)),
        None => (text, None),
    };
    match command.to_ascii_uppercase().as_str() {
        "HEARTBEAT" => {
            let rest = rest.ok_or(malformed("HEARTBEAT", "missing name"))?;
            Ok(Frame::Heartbeat {
                name: rest.trim().to_string(),
            })
        }
        "TALK" => {
            let (id, text) = rest
                .and_then(|r| r.split_once(' '))
                .ok_or(malformed("TALK", "expected <id> <text>"))?;
            if text.is_empty() {
                return Err(malformed("TALK", "empty text"));
            }
            Ok(Frame::Talk {
                id: non_empty(id, "TALK")?,
                text: text.to_string(),
            })
        }
        "FILE" => decode_file(rest),
        "CHUNK" => decode_chunk(rest),
        "END" => {
            let (id, digest) = rest
                .and_then(|r| r.split_once(' '))
                .ok_or(malformed("END", "expected <id> <digest>"))?;
            let digest = digest.trim();
            if digest.is_empty() {
                return Err(malformed("END", "empty digest"));
            }
            Ok(Frame::End {
                id: non_empty(id, "END")?,
                digest: digest.to_string(),
            })
        }
        "ACK" => {
            let rest = rest.ok_or(malformed("ACK", "missing id"))?;
            Ok(Frame::Ack {
                id: non_empty(rest.trim(), "ACK")?,
            })
        }
        "NACK" => {
            let (id, reason) = rest
                .and_then(|r| r.split_once(' '))
                .ok_or(malformed("NACK", "expected <id> <reason>"))?;
            Ok(Frame::Nack {
                id: non_empty(id, "NACK")?,
                reason: NackReason::from(reason.trim()),
            })
        }
        _ => Err(FrameDecodeError::Unknown(command.to_string())),
    }
}

fn decode_file(rest: Option<&str>) -> Result<Frame, FrameDecodeError> {
    const USAGE: &str = "expected <id> <fileName> <sizeBytes>";
    let (id, tail) = rest
        .and_then(|r| r.split_once(' '))
        .ok_or(malformed("FILE", USAGE))?;
    // File names may contain spaces; the size is always the last token.
    let (file_name, size) = tail.rsplit_once(' ').ok_or(malformed("FILE", USAGE))?;
    if file_name.is_empty() {
        return Err(malformed("FILE", "empty file name"));
    }
    let size = size
        .trim()
        .parse::<u64>()
        .map_err(|_| malformed("FILE", "size is not an unsigned integer"))?;
    Ok(Frame::File {
        id: non_empty(id, "FILE")?,
        file_name: file_name.to_string(),
        size,
    })
}

fn decode_chunk(rest: Option<&str>) -> Result<Frame, FrameDecodeError> {
    let mut parts = rest
        .ok_or(malformed("CHUNK", "missing arguments"))?
        .splitn(3, ' ');
    let (Some(id), Some(seq), Some(data)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed("CHUNK", "expected <id> <seq> <base64>"));
    };
    let seq = seq
        .parse::<u32>()
        .ok()
        .filter(|s| *s >= 1)
        .ok_or(malformed("CHUNK", "sequence number must be >= 1"))?;
    let payload = BASE64
        .decode(data.trim())
        .map_err(|_| malformed("CHUNK", "payload is not base64"))?;
    Ok(Frame::Chunk {
        id: non_empty(id, "CHUNK")?,
        seq,
        payload,
    })
}

fn malformed(command: &'static str, reason: &'static str) -> FrameDecodeError {
    FrameDecodeError::Malformed { command, reason }
}

fn non_empty(id: &str, command: &'static str) -> Result<String, FrameDecodeError> {
    if id.is_empty() {
        Err(malformed(command, "empty id"))
    } else {
        Ok(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(s: &str) -> Result<Frame, FrameDecodeError> {
        decode_frame(s.as_bytes())
    }

    #[test]
    fn command_is_case_insensitive_arguments_are_not() {
        assert_eq!(
            decode("heartbeat Laptop-A").unwrap(),
            Frame::Heartbeat {
                name: "Laptop-A".into()
            }
        );
        assert_eq!(
            decode("Talk msg1 Hello World").unwrap(),
            Frame::Talk {
                id: "msg1".into(),
                text: "Hello World".into()
            }
        );
    }

    #[test]
    fn heartbeat_with_empty_name_is_accepted() {
        assert_eq!(
            decode("HEARTBEAT ").unwrap(),
            Frame::Heartbeat { name: String::new() }
        );
        assert!(matches!(
            decode("HEARTBEAT"),
            Err(FrameDecodeError::Malformed { command: "HEARTBEAT", .. })
        ));
    }

    #[test]
    fn chunk_roundtrip_through_base64() {
        let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
        let frame = Frame::Chunk {
            id: "msg2".into(),
            seq: 3,
            payload,
        };
        let bytes = encode_frame(&frame);
        assert!(bytes.len() < MAX_FRAME_LEN);
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }

    #[test]
    fn file_name_may_contain_spaces() {
        assert_eq!(
            decode("FILE msg3 my holiday photo.jpg 4096").unwrap(),
            Frame::File {
                id: "msg3".into(),
                file_name: "my holiday photo.jpg".into(),
                size: 4096
            }
        );
    }

    #[test]
    fn trailing_newline_is_ignored() {
        assert_eq!(
            decode("ACK msg9\r\n").unwrap(),
            Frame::Ack { id: "msg9".into() }
        );
    }

    #[test]
    fn unknown_command_is_distinct_from_malformed() {
        assert_eq!(
            decode("PING x"),
            Err(FrameDecodeError::Unknown("PING".into()))
        );
        assert!(matches!(decode(""), Err(FrameDecodeError::Empty)));
        assert!(matches!(
            decode_frame(&[0xff, 0xfe]),
            Err(FrameDecodeError::NotUtf8)
        ));
    }

    #[test]
    fn malformed_known_commands() {
        for bad in [
            "TALK msg1",
            "TALK msg1 ",
            "FILE msg1 a.txt",
            "FILE msg1 a.txt -5",
            "CHUNK msg1 0 AAAA",
            "CHUNK msg1 1 !!!!",
            "CHUNK msg1 1",
            "END msg1",
            "END msg1  ",
            "ACK",
            "NACK msg1",
        ] {
            assert!(
                matches!(decode(bad), Err(FrameDecodeError::Malformed { .. })),
                "{bad:?} should be malformed"
            );
        }
    }

    #[test]
    fn nack_reason_keeps_unknown_text() {
        assert_eq!(
            decode("NACK msg1 disk full").unwrap(),
            Frame::Nack {
                id: "msg1".into(),
                reason: NackReason::Other("disk full".into())
            }
        );
    }

    #[test]
    fn oversized_datagram_rejected() {
        let big = vec![b'A'; MAX_FRAME_LEN + 1];
        assert_eq!(
            decode_frame(&big),
            Err(FrameDecodeError::TooLarge(MAX_FRAME_LEN + 1))
        );
    }
}
