use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use tokio::time::sleep;
use tracing::trace;

use crate::everlink::common::{Error, Result};
use crate::everlink::config::Settings;
use crate::everlink::crypto::CryptoCodec;
use crate::everlink::net::Stream;

struct ReaderState {
    stream: Option<Arc<Stream>>,
    codec: CryptoCodec,
    /// Ciphertext handed over by the peer's catch-up payload, served (and
    /// decrypted) ahead of anything new on the socket.
    local_buffer: BytesMut,
    sequence_number: u64,
}

/// The receiving half of a resilient stream. sequence_number counts the
/// on-the-wire bytes received from the peer: socket reads as they happen,
/// plus catch-up carryover the moment it is installed (the peer already
/// counts those bytes as delivered). Bytes sitting in local_buffer are
/// therefore already counted and don't advance the counter again when read.
pub struct BackedReader {
    state: Mutex<ReaderState>,
    dead_socket_retry: Duration,
}

impl BackedReader {
    pub fn new(stream: Arc<Stream>, codec: CryptoCodec, settings: &Settings) -> BackedReader {
        BackedReader {
            state: Mutex::new(ReaderState {
                stream: Some(stream),
                codec,
                local_buffer: BytesMut::new(),
                sequence_number: 0,
            }),
            dead_socket_retry: Duration::from_millis(settings.dead_socket_retry_ms),
        }
    }

    /// Reads and decrypts up to buf.len() bytes. Returns 0 (after a short
    /// sleep) while the socket is down; the caller retries. Socket errors and
    /// EOF come back as errors for the Connection to translate.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        loop {
            let stream = {
                let mut state = self.state.lock().map_err(Error::from)?;
                if !state.local_buffer.is_empty() {
                    let n = buf.len().min(state.local_buffer.len());
                    let mut chunk = state.local_buffer.split_to(n);
                    state.codec.decrypt(&mut chunk);
                    buf[..n].copy_from_slice(&chunk);
                    trace!(n, remaining = state.local_buffer.len(), "read from local buffer");
                    return Ok(n);
                }
                state.stream.clone()
            };

            let stream = match stream {
                None => {
                    // The socket is dead; give recovery a moment and let the
                    // caller retry.
                    trace!("tried to read from a dead socket");
                    sleep(self.dead_socket_retry).await;
                    return Ok(0);
                }
                Some(s) => s,
            };

            // Wait for readiness without holding the lock, so revive and
            // invalidate_socket can't be blocked behind a quiet socket.
            stream.readable().await?;

            let mut state = self.state.lock().map_err(Error::from)?;
            match &state.stream {
                Some(current) if Arc::ptr_eq(current, &stream) => {}
                // the socket changed while we waited; start over
                _ => continue,
            }
            match stream.try_read(buf) {
                Ok(0) => return Err(Error::closed()),
                Ok(n) => {
                    state.sequence_number += n as u64;
                    state.codec.decrypt(&mut buf[..n]);
                    return Ok(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
    }

    /// True iff buffered catch-up bytes remain or the live socket has data.
    /// Takes the same lock revive() takes, so the two serialize.
    pub fn has_data(&self) -> bool {
        let state = match self.state.lock() {
            Ok(state) => state,
            Err(_) => return false,
        };
        match &state.stream {
            None => false,
            Some(stream) => !state.local_buffer.is_empty() || stream.is_readable_now(),
        }
    }

    /// Installs the post-recovery socket. carryover is ciphertext the peer
    /// already counts as delivered, so the sequence number advances by its
    /// length now even though it will only be decrypted as it is read.
    pub fn revive(&self, stream: Arc<Stream>, carryover: &[u8]) {
        let mut state = self.state.lock().unwrap();
        state.local_buffer.extend_from_slice(carryover);
        state.sequence_number += carryover.len() as u64;
        state.stream = Some(stream);
    }

    pub fn invalidate_socket(&self) {
        self.state.lock().unwrap().stream = None;
    }

    pub fn sequence_number(&self) -> u64 {
        self.state.lock().unwrap().sequence_number
    }
}
