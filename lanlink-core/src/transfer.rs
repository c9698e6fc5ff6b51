//! Inbound file transfers: per-transfer reassembly, END verification, and terminal idempotence.
//!
//! Each transfer moves RECEIVING -> FINALIZED. A FILE announce allocates storage and
//! enters RECEIVING; END verifies the digest and finalizes whatever the outcome. Once
//! finalized, every FILE/CHUNK/END for that transfer is acknowledged and discarded so the
//! sender's retransmit loop settles without redoing work.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::chunk::chunk_offset;
use crate::integrity::{digest_matches, digest_reader};
use crate::protocol::{chunk_correlation_id, end_correlation_id, Frame, NackReason};
use crate::store::TransferStore;

/// Transfer ids are chosen by the sender, so they are scoped by sender address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferKey {
    pub peer: SocketAddr,
    pub id: String,
}

impl TransferKey {
    pub fn new(peer: SocketAddr, id: &str) -> Self {
        Self {
            peer,
            id: id.to_string(),
        }
    }

    /// Storage tag unique to this transfer.
    pub fn tag(&self) -> String {
        format!("{}-{}", self.peer, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Receiving,
    Finalized,
}

struct InboundTransfer<S> {
    file_name: String,
    declared_size: u64,
    sink: S,
    received: HashSet<u32>,
}

/// What happened to an inbound transfer, for the console.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Offered {
        id: String,
        from: SocketAddr,
        file_name: String,
        size: u64,
    },
    Received {
        id: String,
        from: SocketAddr,
        path: PathBuf,
        size: u64,
    },
    Rejected {
        id: String,
        from: SocketAddr,
        reason: NackReason,
    },
}

/// Reply to send back to the frame's source, plus an optional event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferOutcome {
    pub reply: Frame,
    pub event: Option<TransferEvent>,
}

impl TransferOutcome {
    fn ack(id: String) -> Self {
        Self {
            reply: Frame::Ack { id },
            event: None,
        }
    }

    fn nack(id: String, reason: NackReason) -> Self {
        Self {
            reply: Frame::Nack { id, reason },
            event: None,
        }
    }

    fn with_event(mut self, event: TransferEvent) -> Self {
        self.event = Some(event);
        self
    }
}

pub struct InboundTransfers<S: TransferStore> {
    store: S,
    active: HashMap<TransferKey, InboundTransfer<S::Sink>>,
    /// Never pruned: a finalized transfer stays finalized for the life of the process.
    finalized: HashSet<TransferKey>,
}

impl<S: TransferStore> InboundTransfers<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            active: HashMap::new(),
            finalized: HashSet::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn phase(&self, key: &TransferKey) -> Option<TransferPhase> {
        if self.finalized.contains(key) {
            Some(TransferPhase::Finalized)
        } else if self.active.contains_key(key) {
            Some(TransferPhase::Receiving)
        } else {
            None
        }
    }

    pub fn is_finalized(&self, key: &TransferKey) -> bool {
        self.finalized.contains(key)
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sequence numbers stored so far for an active transfer.
    pub fn received_chunks(&self, key: &TransferKey) -> Option<usize> {
        self.active.get(key).map(|t| t.received.len())
    }

    pub fn on_file(
        &mut self,
        from: SocketAddr,
        id: &str,
        file_name: &str,
        size: u64,
    ) -> TransferOutcome {
        let key = TransferKey::new(from, id);
        if self.finalized.contains(&key) {
            tracing::debug!(id, %from, "FILE for finalized transfer, re-acknowledging");
            return TransferOutcome::ack(id.to_string());
        }
        if self.active.contains_key(&key) {
            tracing::debug!(id, %from, "duplicate FILE announce");
            return TransferOutcome::ack(id.to_string());
        }
        match self.store.create(file_name, &key.tag(), size) {
            Ok(sink) => {
                self.active.insert(
                    key,
                    InboundTransfer {
                        file_name: file_name.to_string(),
                        declared_size: size,
                        sink,
                        received: HashSet::new(),
                    },
                );
                tracing::info!(id, %from, file_name, size, "receiving file");
                TransferOutcome::ack(id.to_string()).with_event(TransferEvent::Offered {
                    id: id.to_string(),
                    from,
                    file_name: file_name.to_string(),
                    size,
                })
            }
            Err(e) => {
                tracing::warn!(id, %from, file_name, size, error = %e, "cannot allocate storage");
                TransferOutcome::nack(id.to_string(), NackReason::InitFailed).with_event(
                    TransferEvent::Rejected {
                        id: id.to_string(),
                        from,
                        reason: NackReason::InitFailed,
                    },
                )
            }
        }
    }

    pub fn on_chunk(
        &mut self,
        from: SocketAddr,
        id: &str,
        seq: u32,
        payload: &[u8],
    ) -> TransferOutcome {
        let key = TransferKey::new(from, id);
        let correlation = chunk_correlation_id(id, seq);
        if self.finalized.contains(&key) {
            return TransferOutcome::ack(correlation);
        }
        let Some(transfer) = self.active.get_mut(&key) else {
            tracing::warn!(id, seq, %from, "CHUNK for transfer that was never announced");
            return TransferOutcome::nack(correlation, NackReason::NotStarted);
        };
        if transfer.received.contains(&seq) {
            tracing::debug!(id, seq, "duplicate chunk");
            return TransferOutcome::ack(correlation);
        }
        let offset = chunk_offset(seq);
        if offset >= transfer.declared_size {
            tracing::warn!(
                id,
                seq,
                offset,
                declared = transfer.declared_size,
                "chunk offset beyond declared size, not written"
            );
            return TransferOutcome::ack(correlation);
        }
        let room = transfer.declared_size - offset;
        let len = payload
            .len()
            .min(usize::try_from(room).unwrap_or(usize::MAX));
        let written = transfer
            .sink
            .seek(SeekFrom::Start(offset))
            .and_then(|_| transfer.sink.write_all(&payload[..len]));
        if let Err(e) = written {
            tracing::warn!(id, seq, error = %e, "chunk write failed");
            return TransferOutcome::nack(correlation, NackReason::WriteFailed);
        }
        transfer.received.insert(seq);
        tracing::debug!(id, seq, bytes = len, "chunk stored");
        TransferOutcome::ack(correlation)
    }

    pub fn on_end(&mut self, from: SocketAddr, id: &str, digest: &str) -> TransferOutcome {
        let key = TransferKey::new(from, id);
        let correlation = end_correlation_id(id);
        if self.finalized.contains(&key) {
            return TransferOutcome::ack(correlation);
        }
        let Some(mut transfer) = self.active.remove(&key) else {
            tracing::warn!(id, %from, "END for transfer that was never announced");
            return TransferOutcome::nack(correlation, NackReason::NotStarted);
        };
        self.finalized.insert(key);

        let computed = transfer
            .sink
            .flush()
            .and_then(|_| transfer.sink.seek(SeekFrom::Start(0)))
            .and_then(|_| digest_reader((&mut transfer.sink).take(transfer.declared_size)));
        let verified = match &computed {
            Ok(local) => digest_matches(local, digest),
            Err(e) => {
                tracing::warn!(id, error = %e, "cannot read back stored file");
                false
            }
        };

        if verified {
            match self.store.commit(&transfer.file_name, transfer.sink) {
                Ok(path) => {
                    tracing::info!(id, %from, path = %path.display(), "file received and verified");
                    TransferOutcome::ack(correlation).with_event(TransferEvent::Received {
                        id: id.to_string(),
                        from,
                        path,
                        size: transfer.declared_size,
                    })
                }
                Err(e) => {
                    tracing::warn!(id, error = %e, "cannot commit received file");
                    Self::reject(from, id, correlation, NackReason::WriteFailed)
                }
            }
        } else {
            tracing::warn!(
                id,
                %from,
                expected = digest,
                computed = computed.as_deref().unwrap_or("-"),
                "digest mismatch, deleting file"
            );
            if let Err(e) = self.store.discard(&transfer.file_name, transfer.sink) {
                tracing::warn!(id, error = %e, "cannot delete rejected file");
            }
            Self::reject(from, id, correlation, NackReason::HashInvalid)
        }
    }

    fn reject(
        from: SocketAddr,
        id: &str,
        correlation: String,
        reason: NackReason,
    ) -> TransferOutcome {
        TransferOutcome::nack(correlation, reason.clone()).with_event(TransferEvent::Rejected {
            id: id.to_string(),
            from,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::CHUNK_SIZE;
    use crate::integrity::digest_hex;
    use crate::store::{DiskStore, MemoryStore};
    use rand::seq::SliceRandom;
    use rand::Rng;

    fn sender() -> SocketAddr {
        SocketAddr::from(([192, 168, 0, 7], 9876))
    }

    fn is_ack(o: &TransferOutcome, id: &str) -> bool {
        matches!(&o.reply, Frame::Ack { id: got } if got == id)
    }

    fn is_nack(o: &TransferOutcome, id: &str, reason: NackReason) -> bool {
        matches!(&o.reply, Frame::Nack { id: got, reason: r } if got == id && *r == reason)
    }

    fn blocks(data: &[u8]) -> Vec<(u32, Vec<u8>)> {
        data.chunks(CHUNK_SIZE)
            .enumerate()
            .map(|(i, c)| (i as u32 + 1, c.to_vec()))
            .collect()
    }

    #[test]
    fn reversed_chunk_order_reassembles_identically() {
        let data: Vec<u8> = (0..2048u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut t = InboundTransfers::new(MemoryStore::new());
        assert!(is_ack(&t.on_file(sender(), "f1", "photo.bin", 2048), "f1"));
        for (seq, block) in blocks(&data).into_iter().rev() {
            let o = t.on_chunk(sender(), "f1", seq, &block);
            assert!(is_ack(&o, &format!("f1-seq{seq}")));
        }
        let o = t.on_end(sender(), "f1", &digest_hex(&data));
        assert!(is_ack(&o, "f1-end"));
        assert!(matches!(o.event, Some(TransferEvent::Received { size: 2048, .. })));
        assert_eq!(t.store().get("photo.bin").unwrap(), &data[..]);
        assert_eq!(
            t.phase(&TransferKey::new(sender(), "f1")),
            Some(TransferPhase::Finalized)
        );
        assert_eq!(t.active_count(), 0);
    }

    #[test]
    fn shuffled_chunks_on_disk() {
        let mut rng = rand::thread_rng();
        let size = rng.gen_range(5_000..20_000);
        let data: Vec<u8> = (0..size).map(|_| rng.gen()).collect();
        let dir = tempfile::tempdir().unwrap();
        let mut t = InboundTransfers::new(DiskStore::new(dir.path()));
        t.on_file(sender(), "msg3", "random.dat", data.len() as u64);
        let mut order = blocks(&data);
        order.shuffle(&mut rng);
        for (seq, block) in &order {
            t.on_chunk(sender(), "msg3", *seq, block);
        }
        // Upper-case digest must still match.
        let o = t.on_end(sender(), "msg3", &digest_hex(&data).to_uppercase());
        assert!(is_ack(&o, "msg3-end"));
        let stored = std::fs::read(dir.path().join("received_random.dat")).unwrap();
        assert_eq!(stored, data);
    }

    #[test]
    fn duplicate_chunk_acked_and_bytes_unchanged() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "f1", "a", 4);
        assert!(is_ack(&t.on_chunk(sender(), "f1", 1, b"good"), "f1-seq1"));
        assert!(is_ack(&t.on_chunk(sender(), "f1", 1, b"evil"), "f1-seq1"));
        let key = TransferKey::new(sender(), "f1");
        assert_eq!(t.received_chunks(&key), Some(1));
        let o = t.on_end(sender(), "f1", &digest_hex(b"good"));
        assert!(is_ack(&o, "f1-end"));
        assert_eq!(t.store().get("a").unwrap(), b"good");
    }

    #[test]
    fn chunk_before_announce_is_not_started() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        let o = t.on_chunk(sender(), "f9", 1, b"x");
        assert!(is_nack(&o, "f9-seq1", NackReason::NotStarted));
        let o = t.on_end(sender(), "f9", &digest_hex(b"x"));
        assert!(is_nack(&o, "f9-end", NackReason::NotStarted));
        assert_eq!(t.phase(&TransferKey::new(sender(), "f9")), None);
    }

    #[test]
    fn out_of_bounds_chunk_acked_but_not_written() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "f1", "small", 10);
        let o = t.on_chunk(sender(), "f1", 2, &[1u8; 10]);
        assert!(is_ack(&o, "f1-seq2"));
        assert_eq!(t.received_chunks(&TransferKey::new(sender(), "f1")), Some(0));
        let o = t.on_end(sender(), "f1", &digest_hex(&[0u8; 10]));
        assert!(is_ack(&o, "f1-end"));
        assert_eq!(t.store().get("small").unwrap(), &[0u8; 10]);
    }

    #[test]
    fn oversized_tail_chunk_is_truncated_to_declared_size() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "f1", "tail", 3);
        t.on_chunk(sender(), "f1", 1, b"abcdef");
        let o = t.on_end(sender(), "f1", &digest_hex(b"abc"));
        assert!(is_ack(&o, "f1-end"));
        assert_eq!(t.store().get("tail").unwrap(), b"abc");
    }

    #[test]
    fn hash_mismatch_deletes_file_and_finalizes() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = InboundTransfers::new(DiskStore::new(dir.path()));
        t.on_file(sender(), "f1", "bad.bin", 4);
        t.on_chunk(sender(), "f1", 1, b"data");
        let o = t.on_end(sender(), "f1", &digest_hex(b"other"));
        assert!(is_nack(&o, "f1-end", NackReason::HashInvalid));
        assert!(matches!(
            o.event,
            Some(TransferEvent::Rejected {
                reason: NackReason::HashInvalid,
                ..
            })
        ));
        assert!(!dir.path().join("received_bad.bin").exists());
        assert!(t.is_finalized(&TransferKey::new(sender(), "f1")));

        // A retransmitted END is now acknowledged without reprocessing.
        let o = t.on_end(sender(), "f1", &digest_hex(b"other"));
        assert!(is_ack(&o, "f1-end"));
        assert!(o.event.is_none());
    }

    #[test]
    fn overlapping_same_name_transfers_on_disk_stay_separate() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = InboundTransfers::new(DiskStore::new(dir.path()));
        let other = SocketAddr::from(([192, 168, 0, 8], 9876));

        t.on_file(sender(), "msg1", "photo.bin", 4);
        t.on_chunk(sender(), "msg1", 1, b"AAAA");
        t.on_file(other, "msg1", "photo.bin", 4);
        t.on_chunk(other, "msg1", 1, b"BBBB");

        let first = t.on_end(sender(), "msg1", &digest_hex(b"AAAA"));
        assert!(is_ack(&first, "msg1-end"));
        let Some(TransferEvent::Received { path, .. }) = first.event else {
            panic!("first transfer not received");
        };
        assert_eq!(std::fs::read(&path).unwrap(), b"AAAA");

        let second = t.on_end(other, "msg1", &digest_hex(b"BBBB"));
        assert!(is_ack(&second, "msg1-end"));
        let Some(TransferEvent::Received { path, .. }) = second.event else {
            panic!("second transfer not received");
        };
        assert_eq!(path, dir.path().join("received_photo.bin"));
        assert_eq!(std::fs::read(&path).unwrap(), b"BBBB");

        // Only the final file remains; no reassembly leftovers.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("received_photo.bin")]);
    }

    #[test]
    fn rejected_transfer_does_not_touch_concurrent_one() {
        let dir = tempfile::tempdir().unwrap();
        let mut t = InboundTransfers::new(DiskStore::new(dir.path()));
        let other = SocketAddr::from(([192, 168, 0, 8], 9876));

        t.on_file(sender(), "msg1", "photo.bin", 4);
        t.on_chunk(sender(), "msg1", 1, b"AAAA");
        t.on_file(other, "msg2", "photo.bin", 4);
        t.on_chunk(other, "msg2", 1, b"BBBB");

        let bad = t.on_end(sender(), "msg1", &digest_hex(b"nope"));
        assert!(is_nack(&bad, "msg1-end", NackReason::HashInvalid));
        let good = t.on_end(other, "msg2", &digest_hex(b"BBBB"));
        assert!(is_ack(&good, "msg2-end"));
        assert_eq!(
            std::fs::read(dir.path().join("received_photo.bin")).unwrap(),
            b"BBBB"
        );
    }

    #[test]
    fn finalized_transfer_acks_everything_without_mutation() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "f1", "done", 4);
        t.on_chunk(sender(), "f1", 1, b"done");
        t.on_end(sender(), "f1", &digest_hex(b"done"));

        assert!(is_ack(&t.on_file(sender(), "f1", "done", 4), "f1"));
        assert!(is_ack(&t.on_chunk(sender(), "f1", 1, b"XXXX"), "f1-seq1"));
        assert!(is_ack(&t.on_end(sender(), "f1", "00"), "f1-end"));
        assert_eq!(t.active_count(), 0);
        assert_eq!(t.store().get("done").unwrap(), b"done");
    }

    #[test]
    fn init_failure_nacks_and_never_enters_receiving() {
        let mut t = InboundTransfers::new(MemoryStore::with_limit(100));
        let o = t.on_file(sender(), "f1", "huge", 1_000);
        assert!(is_nack(&o, "f1", NackReason::InitFailed));
        assert_eq!(t.phase(&TransferKey::new(sender(), "f1")), None);
        assert!(is_nack(
            &t.on_chunk(sender(), "f1", 1, b"x"),
            "f1-seq1",
            NackReason::NotStarted
        ));
    }

    #[test]
    fn duplicate_announce_keeps_progress() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "f1", "keep", 4);
        t.on_chunk(sender(), "f1", 1, b"keep");
        let o = t.on_file(sender(), "f1", "keep", 4);
        assert!(is_ack(&o, "f1"));
        assert!(o.event.is_none());
        assert_eq!(t.received_chunks(&TransferKey::new(sender(), "f1")), Some(1));
    }

    #[test]
    fn same_id_from_different_senders_is_independent() {
        let other = SocketAddr::from(([192, 168, 0, 8], 9876));
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "msg1", "one", 1);
        t.on_chunk(sender(), "msg1", 1, b"1");
        t.on_end(sender(), "msg1", &digest_hex(b"1"));

        let o = t.on_file(other, "msg1", "two", 1);
        assert!(matches!(o.event, Some(TransferEvent::Offered { .. })));
        assert_eq!(
            t.phase(&TransferKey::new(other, "msg1")),
            Some(TransferPhase::Receiving)
        );
    }

    #[test]
    fn empty_file_completes() {
        let mut t = InboundTransfers::new(MemoryStore::new());
        t.on_file(sender(), "f1", "empty", 0);
        let o = t.on_end(sender(), "f1", &digest_hex(b""));
        assert!(is_ack(&o, "f1-end"));
        assert_eq!(t.store().get("empty").unwrap(), b"");
    }
}
