//! Console: line commands on stdin, node events printed to stdout.

use std::path::PathBuf;
use std::time::Instant;

use lanlink_core::protocol::{end_transfer_id, owning_transfer};
use lanlink_core::{NodeEvent, TransferEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::node::Node;

const HELP: &str = "\
commands:
  devices | peers           list known peers
  talk <name> <message>     send a text message
  sendfile <name> <path>    send a file
  pending                   list unacknowledged frames
  help                      show this help
  quit                      exit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Peers,
    Talk { peer: String, text: String },
    SendFile { peer: String, path: PathBuf },
    Pending,
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CommandError {
    #[error("usage: {0}")]
    Usage(&'static str),
    #[error("unknown command '{0}' (try 'help')")]
    Unknown(String),
}

/// First whitespace-delimited word and the remainder with leading whitespace removed.
fn split_word(s: &str) -> Option<(&str, &str)> {
    let s = s.trim_start();
    if s.is_empty() {
        return None;
    }
    match s.find(char::is_whitespace) {
        Some(i) => Some((&s[..i], s[i..].trim_start())),
        None => Some((s, "")),
    }
}

/// Parse one console line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<Command>, CommandError> {
    let Some((verb, rest)) = split_word(line.trim_end()) else {
        return Ok(None);
    };
    let cmd = match verb.to_ascii_lowercase().as_str() {
        "devices" | "peers" => Command::Peers,
        "talk" => match split_word(rest) {
            Some((peer, text)) if !text.is_empty() => Command::Talk {
                peer: peer.to_string(),
                text: text.to_string(),
            },
            _ => return Err(CommandError::Usage("talk <name> <message>")),
        },
        "sendfile" => match split_word(rest) {
            Some((peer, path)) if !path.is_empty() => Command::SendFile {
                peer: peer.to_string(),
                path: PathBuf::from(path),
            },
            _ => return Err(CommandError::Usage("sendfile <name> <path>")),
        },
        "pending" => Command::Pending,
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => return Err(CommandError::Unknown(verb.to_string())),
    };
    Ok(Some(cmd))
}

/// One-line description of an event for the console.
pub fn describe(event: &NodeEvent) -> String {
    match event {
        NodeEvent::PeerDiscovered { name, addr } => format!("[+] device {name} ({addr})"),
        NodeEvent::PeerExpired { name, addr } => format!("[-] device {name} ({addr}) timed out"),
        NodeEvent::TalkReceived { id, from, text } => format!("[{from}] {text}  ({id})"),
        NodeEvent::Acknowledged { id } => format!("[ack] {id}"),
        NodeEvent::NackReceived { id, from, reason } => {
            format!("[nack] {id} from {from}: {reason}")
        }
        NodeEvent::DeliveryFailed { id, destination } => {
            format!("[failed] {id} to {destination}: no acknowledgment")
        }
        NodeEvent::Transfer(TransferEvent::Offered {
            id,
            from,
            file_name,
            size,
        }) => format!("[file] {from} is sending {file_name} ({size} bytes, {id})"),
        NodeEvent::Transfer(TransferEvent::Received { id, path, size, .. }) => {
            format!("[file] saved {} ({size} bytes, {id})", path.display())
        }
        NodeEvent::Transfer(TransferEvent::Rejected { id, from, reason }) => {
            format!("[file] transfer {id} from {from} failed: {reason}")
        }
    }
}

/// Per-chunk acknowledgments are not printed; the END's acknowledgment stands for the file.
fn is_chunk_ack(event: &NodeEvent) -> bool {
    matches!(event, NodeEvent::Acknowledged { id }
        if end_transfer_id(id).is_none() && owning_transfer(id) != id.as_str())
}

async fn execute(node: &Node, cmd: Command) {
    match cmd {
        Command::Peers => {
            let peers = node.list_peers();
            if peers.is_empty() {
                println!("no devices");
            }
            let now = Instant::now();
            for p in peers {
                println!(
                    "  {:<16} {:<22} last heartbeat {} ms ago",
                    p.name,
                    p.addr,
                    p.age(now).as_millis()
                );
            }
        }
        Command::Talk { peer, text } => match node.send_text(&peer, &text).await {
            Ok(id) => println!("sent {id}"),
            Err(e) => println!("error: {e}"),
        },
        Command::SendFile { peer, path } => match node.send_file(&peer, path).await {
            Ok(id) => println!("sending as {id}"),
            Err(e) => println!("error: {e}"),
        },
        Command::Pending => {
            let ids = node.pending_ids();
            if ids.is_empty() {
                println!("nothing pending");
            }
            for id in ids {
                println!("  {id}");
            }
        }
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}

/// Read commands until `quit`. When stdin closes, keep printing events.
pub async fn run(node: &Node, mut events: mpsc::UnboundedReceiver<NodeEvent>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    println!(
        "{} listening on {}. type 'help' for commands.",
        node.name(),
        node.local_addr()?
    );
    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line? {
                Some(line) => match parse_command(&line) {
                    Ok(Some(Command::Quit)) => return Ok(()),
                    Ok(Some(cmd)) => execute(node, cmd).await,
                    Ok(None) => {}
                    Err(e) => println!("{e}"),
                },
                None => {
                    tracing::debug!("stdin closed");
                    stdin_open = false;
                }
            },
            event = events.recv() => match event {
                Some(e) if is_chunk_ack(&e) => {}
                Some(e) => println!("{}", describe(&e)),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lanlink_core::NackReason;

    #[test]
    fn parses_commands() {
        assert_eq!(parse_command("  "), Ok(None));
        assert_eq!(parse_command("DEVICES"), Ok(Some(Command::Peers)));
        assert_eq!(parse_command("peers\n"), Ok(Some(Command::Peers)));
        assert_eq!(
            parse_command("talk bob  hello   world "),
            Ok(Some(Command::Talk {
                peer: "bob".into(),
                text: "hello   world".into()
            }))
        );
        assert_eq!(
            parse_command("sendfile bob /tmp/my file.txt"),
            Ok(Some(Command::SendFile {
                peer: "bob".into(),
                path: PathBuf::from("/tmp/my file.txt")
            }))
        );
        assert_eq!(parse_command("quit"), Ok(Some(Command::Quit)));
    }

    #[test]
    fn usage_errors() {
        assert_eq!(
            parse_command("talk bob"),
            Err(CommandError::Usage("talk <name> <message>"))
        );
        assert_eq!(
            parse_command("sendfile"),
            Err(CommandError::Usage("sendfile <name> <path>"))
        );
        assert_eq!(
            parse_command("ping bob"),
            Err(CommandError::Unknown("ping".into()))
        );
    }

    #[test]
    fn chunk_acks_are_quiet() {
        let ack = |id: &str| NodeEvent::Acknowledged { id: id.into() };
        assert!(is_chunk_ack(&ack("msg2-seq5")));
        assert!(!is_chunk_ack(&ack("msg2-end")));
        assert!(!is_chunk_ack(&ack("msg2")));
    }

    #[test]
    fn describes_events() {
        let from = "10.0.0.2:9876".parse().unwrap();
        assert_eq!(
            describe(&NodeEvent::TalkReceived {
                id: "msg3".into(),
                from,
                text: "hi".into()
            }),
            "[10.0.0.2:9876] hi  (msg3)"
        );
        assert_eq!(
            describe(&NodeEvent::NackReceived {
                id: "msg4-end".into(),
                from,
                reason: NackReason::HashInvalid
            }),
            "[nack] msg4-end from 10.0.0.2:9876: hash-invalid"
        );
    }
}
