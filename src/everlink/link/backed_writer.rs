use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, trace};

use crate::everlink::common::{Error, Result};
use crate::everlink::config::Settings;
use crate::everlink::crypto::CryptoCodec;
use crate::everlink::net::Stream;

/// What happened to one write call. Once a write returns Success or
/// WroteWithFailure the bytes are committed: they were encrypted, counted,
/// and recorded for replay, so the caller must consider them written even if
/// the socket failed partway. Skipped means nothing happened at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Skipped,
    Success,
    WroteWithFailure,
}

/// Bounded history of already-sent ciphertext, oldest chunk first. The
/// concatenation of the chunks is the last `total()` bytes put on the wire,
/// i.e. the sequence-number range [written - total(), written).
pub(crate) struct ReplayBuffer {
    chunks: VecDeque<BytesMut>,
    chunk_bytes: usize,
    capacity_bytes: usize,
    total: usize,
}

impl ReplayBuffer {
    pub fn new(chunk_bytes: usize, capacity_bytes: usize) -> ReplayBuffer {
        ReplayBuffer {
            chunks: VecDeque::new(),
            chunk_bytes,
            capacity_bytes,
            total: 0,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn push(&mut self, data: &[u8]) {
        match self.chunks.back_mut() {
            Some(last) if last.len() + data.len() < self.chunk_bytes => {
                last.extend_from_slice(data);
            }
            _ => self.chunks.push_back(BytesMut::from(data)),
        }
        self.total += data.len();
        // Evict whole chunks from the old end once over capacity. The newest
        // chunk always stays, even if a single write exceeded the bound.
        while self.total > self.capacity_bytes && self.chunks.len() > 1 {
            let evicted = self.chunks.pop_front().unwrap();
            self.total -= evicted.len();
        }
    }

    /// The most recent `count` bytes, in write order.
    pub fn replay(&self, count: usize) -> Result<Bytes> {
        if count > self.total {
            return Err(Error::recovery_error(format!(
                "peer is too far behind: needs {} bytes, only {} retained",
                count, self.total
            )));
        }
        let mut skip = self.total - count;
        let mut out = BytesMut::with_capacity(count);
        for chunk in &self.chunks {
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            out.extend_from_slice(&chunk[skip..]);
            skip = 0;
        }
        debug_assert_eq!(out.len(), count);
        Ok(out.freeze())
    }
}

struct WriterState {
    stream: Option<Arc<Stream>>,
    codec: CryptoCodec,
    backup: ReplayBuffer,
    sequence_number: u64,
}

/// The sending half of a resilient stream: encrypts, records the ciphertext
/// for replay, then sends. All state lives behind one async mutex so a write
/// in flight and a recovery can never interleave.
pub struct BackedWriter {
    state: Arc<Mutex<WriterState>>,
}

impl BackedWriter {
    pub fn new(stream: Arc<Stream>, codec: CryptoCodec, settings: &Settings) -> BackedWriter {
        BackedWriter {
            state: Arc::new(Mutex::new(WriterState {
                stream: Some(stream),
                codec,
                backup: ReplayBuffer::new(settings.backup_chunk_bytes, settings.replay_buffer_bytes),
                sequence_number: 0,
            })),
        }
    }

    pub async fn write(&self, buf: &[u8]) -> WriteOutcome {
        let mut state = self.state.lock().await;
        let stream = match &state.stream {
            // No socket: skip before touching the codec, or its counter would
            // run ahead of the bytes that actually exist.
            None => return WriteOutcome::Skipped,
            Some(s) => s.clone(),
        };

        let mut data = BytesMut::from(buf);
        state.codec.encrypt(&mut data);
        state.sequence_number += data.len() as u64;
        state.backup.push(&data);

        // From here on the bytes are committed; a socket failure only changes
        // the outcome the caller sees, recovery will retransmit.
        let mut pos = 0;
        while pos < data.len() {
            match stream.try_write(&data[pos..]) {
                Ok(0) => return WriteOutcome::WroteWithFailure,
                Ok(n) => pos += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if stream.writable().await.is_err() {
                        return WriteOutcome::WroteWithFailure;
                    }
                }
                Err(e) => {
                    trace!(%e, "write failed after encrypting");
                    return WriteOutcome::WroteWithFailure;
                }
            }
        }
        WriteOutcome::Success
    }

    /// Locks out writers for the duration of the catch-up exchange. Writes
    /// queued behind the guard proceed (or skip) once it drops.
    pub async fn begin_recovery(&self) -> RecoveryGuard {
        debug!("locking writer for recovery");
        RecoveryGuard {
            state: self.state.clone().lock_owned().await,
        }
    }

    pub async fn invalidate_socket(&self) {
        self.state.lock().await.stream = None;
    }

    pub async fn sequence_number(&self) -> u64 {
        self.state.lock().await.sequence_number
    }
}

/// Exclusive hold on the writer while a recovery handshake is in flight.
/// Consumed by revive() on success; dropping it without reviving leaves the
/// writer socketless (writes keep skipping) but unlocked.
pub struct RecoveryGuard {
    state: OwnedMutexGuard<WriterState>,
}

impl RecoveryGuard {
    /// The replay payload for a peer that has received `peer_sequence_number`
    /// of our bytes so far.
    pub fn catchup(&self, peer_sequence_number: u64) -> Result<Bytes> {
        if self.state.stream.is_some() {
            return Err(Error::recovery_error(
                "can't recover while the socket is still live",
            ));
        }
        if peer_sequence_number > self.state.sequence_number {
            return Err(Error::recovery_error(format!(
                "peer claims {} bytes received but only {} were sent",
                peer_sequence_number, self.state.sequence_number
            )));
        }
        let count = (self.state.sequence_number - peer_sequence_number) as usize;
        debug!(count, "recovering bytes for peer");
        self.state.backup.replay(count)
    }

    pub fn sequence_number(&self) -> u64 {
        self.state.sequence_number
    }

    /// Installs the new socket and releases the writer.
    pub fn revive(mut self, stream: Arc<Stream>) {
        debug!("reviving writer");
        self.state.stream = Some(stream);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::everlink::crypto::{Key, CLIENT_TO_SERVER_NONCE};
    use crate::everlink::net::fake::FakeStream;

    fn key() -> Key {
        Key::new(b"12345678901234567890123456789012").unwrap()
    }

    #[test]
    fn test_replay_buffer_coalesces_small_writes() {
        let mut backup = ReplayBuffer::new(64, 1024);
        backup.push(b"aaaa");
        backup.push(b"bbbb");
        assert_eq!(backup.chunks.len(), 1);
        assert_eq!(backup.total(), 8);
        assert_eq!(backup.replay(8).unwrap().as_ref(), b"aaaabbbb");
    }

    #[test]
    fn test_replay_buffer_returns_exact_tail() {
        let mut backup = ReplayBuffer::new(4, 1024);
        backup.push(b"abcd");
        backup.push(b"efgh");
        backup.push(b"ij");
        assert_eq!(backup.replay(0).unwrap().as_ref(), b"");
        assert_eq!(backup.replay(2).unwrap().as_ref(), b"ij");
        assert_eq!(backup.replay(5).unwrap().as_ref(), b"fghij");
        assert_eq!(backup.replay(10).unwrap().as_ref(), b"abcdefghij");
    }

    #[test]
    fn test_replay_buffer_evicts_oldest() {
        let mut backup = ReplayBuffer::new(4, 8);
        backup.push(b"aaaa");
        backup.push(b"bbbb");
        backup.push(b"cccc"); // pushes total to 12, evicts "aaaa"
        assert_eq!(backup.total(), 8);
        assert_eq!(backup.replay(8).unwrap().as_ref(), b"bbbbcccc");
        assert!(backup.replay(9).is_err());
    }

    #[tokio::test]
    async fn test_write_skips_without_touching_codec() {
        let (a, _b) = FakeStream::pair();
        let writer = BackedWriter::new(
            Arc::new(crate::everlink::net::Stream::new_fake(a)),
            CryptoCodec::new(&key(), CLIENT_TO_SERVER_NONCE),
            &Settings::default(),
        );
        writer.invalidate_socket().await;
        assert_eq!(writer.write(b"dropped").await, WriteOutcome::Skipped);
        // nothing was counted
        assert_eq!(writer.sequence_number().await, 0);
    }

    #[tokio::test]
    async fn test_recovery_guard_replays_unacked_suffix() {
        let (a, b) = FakeStream::pair();
        let stream = Arc::new(crate::everlink::net::Stream::new_fake(a));
        let writer = BackedWriter::new(
            stream,
            CryptoCodec::new(&key(), CLIENT_TO_SERVER_NONCE),
            &Settings::default(),
        );
        assert_eq!(writer.write(b"hello world").await, WriteOutcome::Success);
        assert_eq!(writer.sequence_number().await, 11);

        // capture what actually hit the wire
        let mut wire = [0u8; 11];
        assert_eq!(b.try_read(&mut wire).unwrap(), 11);

        writer.invalidate_socket().await;
        let guard = writer.begin_recovery().await;
        // peer saw the first 4 bytes; the replay is the rest of the wire bytes
        let catchup = guard.catchup(4).unwrap();
        assert_eq!(catchup.as_ref(), &wire[4..]);
        // peer ahead of us is a protocol violation
        assert!(guard.catchup(12).is_err());
    }

    #[tokio::test]
    async fn test_recovery_fails_when_peer_is_past_the_window() {
        let (a, _b) = FakeStream::pair();
        let stream = Arc::new(crate::everlink::net::Stream::new_fake(a));
        let mut settings = Settings::default();
        settings.backup_chunk_bytes = 16;
        settings.replay_buffer_bytes = 64;
        let writer = BackedWriter::new(
            stream,
            CryptoCodec::new(&key(), CLIENT_TO_SERVER_NONCE),
            &settings,
        );
        for _ in 0..16 {
            assert_eq!(writer.write(&[0u8; 16]).await, WriteOutcome::Success);
        }
        writer.invalidate_socket().await;
        let guard = writer.begin_recovery().await;
        // a peer that saw nothing needs all 256 bytes, but only 64 remain
        assert!(guard.catchup(0).is_err());
        // a peer just inside the window is fine
        assert!(guard.catchup(256 - 32).is_ok());
    }
}
