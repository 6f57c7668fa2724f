use std::sync::atomic::Ordering::SeqCst;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::everlink::common::{Error, Result};
use crate::everlink::config::Settings;
use crate::everlink::crypto::{CryptoCodec, Key};
use crate::everlink::link::backed_reader::BackedReader;
use crate::everlink::link::backed_writer::{BackedWriter, WriteOutcome};
use crate::everlink::net::Stream;
use crate::everlink::proto::wire;
use crate::everlink::proto::{
    check_frame_length, CatchupBuffer, Packet, PacketType, SequenceHeader, LENGTH_PREFIX_BYTES,
};

/// How long read_all/write_all yield between retries while the stream is
/// interrupted or a partial transfer is in progress.
const SPIN_YIELD: Duration = Duration::from_millis(1);

/// One endpoint of a resilient stream: a reader half, a writer half, and the
/// socket both currently share. The socket may die at any moment; reads then
/// return 0 and writes are dropped until recover() installs a replacement and
/// replays whatever the peer missed. Transient socket errors never escape
/// this type.
pub struct Connection {
    reader: BackedReader,
    writer: BackedWriter,
    stream: Mutex<Option<Arc<Stream>>>,
    shutting_down: AtomicBool,
    recoveries: AtomicU64,
    max_frame_bytes: usize,
    /// The catch-up payload is bounded by the replay window, not by the
    /// ordinary frame cap.
    max_catchup_bytes: usize,
}

impl Connection {
    /// read_nonce/write_nonce pick the two direction codecs; the two sides of
    /// a session must mirror them.
    pub fn new(
        stream: Arc<Stream>,
        key: &Key,
        read_nonce: u64,
        write_nonce: u64,
        settings: &Settings,
    ) -> Connection {
        Connection {
            reader: BackedReader::new(
                stream.clone(),
                CryptoCodec::new(key, read_nonce),
                settings,
            ),
            writer: BackedWriter::new(
                stream.clone(),
                CryptoCodec::new(key, write_nonce),
                settings,
            ),
            stream: Mutex::new(Some(stream)),
            shutting_down: AtomicBool::new(false),
            recoveries: AtomicU64::new(0),
            max_frame_bytes: settings.max_frame_bytes,
            max_catchup_bytes: settings.max_frame_bytes.max(settings.replay_buffer_bytes + 1024),
        }
    }

    /// Reads up to buf.len() bytes. 0 means "nothing right now" (outage or
    /// quiet socket); only non-transient errors propagate.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        match self.reader.read(buf).await {
            Ok(n) => Ok(n),
            Err(e) if e.is_transient() => {
                info!(%e, "closing socket on severed read");
                self.close_socket().await;
                Ok(0)
            }
            Err(e) => Err(e),
        }
    }

    /// Reads exactly buf.len() bytes, riding out any number of outages.
    pub async fn read_all(&self, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            if self.is_shutdown() {
                return Err(Error::shutdown());
            }
            let n = self.read(&mut buf[pos..]).await?;
            pos += n;
            if n == 0 && pos < buf.len() {
                sleep(SPIN_YIELD).await;
            }
        }
        Ok(())
    }

    /// Writes buf. Returns buf.len() once the bytes are committed (even if
    /// the socket failed mid-write; recovery retransmits), 0 if the write was
    /// dropped because the connection is interrupted.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.stream.lock().map_err(Error::from)?.is_none() {
            return Ok(0);
        }
        match self.writer.write(buf).await {
            WriteOutcome::Skipped => Ok(0),
            WriteOutcome::Success => Ok(buf.len()),
            WriteOutcome::WroteWithFailure => {
                debug!("socket severed during write");
                self.close_socket().await;
                Ok(buf.len())
            }
        }
    }

    /// Writes all of buf, riding out outages. Dropped attempts are retried
    /// whole; committed attempts never repeat.
    pub async fn write_all(&self, buf: &[u8]) -> Result<()> {
        loop {
            if self.is_shutdown() {
                return Err(Error::shutdown());
            }
            if self.write(buf).await? > 0 {
                return Ok(());
            }
            sleep(SPIN_YIELD).await;
        }
    }

    /// Reads one length-prefixed protobuf message off the resilient stream.
    pub async fn read_proto<M: Message + Default>(&self) -> Result<M> {
        let body = self.read_frame().await?;
        M::decode(body.as_ref()).map_err(Error::from)
    }

    /// Writes one length-prefixed protobuf message to the resilient stream.
    pub async fn write_proto<M: Message>(&self, msg: &M) -> Result<()> {
        let body = msg.encode_to_vec();
        let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + body.len());
        buf.put_i64_le(body.len() as i64);
        buf.extend_from_slice(&body);
        self.write_all(&buf).await
    }

    /// Reads one tagged Packet (type byte, then a length-prefixed payload).
    pub async fn read_packet(&self) -> Result<Packet> {
        let mut tag = [0u8; 1];
        self.read_all(&mut tag).await?;
        let packet_type = PacketType::new(tag[0])?;
        let payload = self.read_frame().await?;
        Ok(Packet::new(packet_type, payload))
    }

    pub async fn write_packet(&self, packet: &Packet) -> Result<()> {
        self.write_all(&packet.encode()).await
    }

    async fn read_frame(&self) -> Result<Bytes> {
        let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
        self.read_all(&mut len_buf).await?;
        let length = check_frame_length(i64::from_le_bytes(len_buf), self.max_frame_bytes)?;
        let mut body = vec![0u8; length];
        self.read_all(&mut body).await?;
        Ok(Bytes::from(body))
    }

    pub fn has_data(&self) -> bool {
        self.reader.has_data()
    }

    /// Tears down the current socket, if any, and leaves the connection
    /// interrupted. The stream is closed before either half is invalidated so
    /// tasks parked on readiness wake up and observe the closure.
    pub async fn close_socket(&self) {
        let stream = match self.stream.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => return,
        };
        let stream = match stream {
            Some(stream) => stream,
            None => return,
        };
        stream.close();
        self.reader.invalidate_socket();
        self.writer.invalidate_socket().await;
        debug!("closed socket");
    }

    /// The recovery handshake, run over a fresh socket after a break:
    /// exchange received-byte counts, then exchange catch-up payloads, then
    /// put both halves back on the new socket. On failure the new socket is
    /// closed and the connection stays interrupted.
    pub async fn recover(&self, new_stream: Arc<Stream>) -> Result<()> {
        info!("recovering connection");
        match self.try_recover(&new_stream).await {
            Ok(()) => {
                self.recoveries.fetch_add(1, SeqCst);
                info!("finished recovering");
                Ok(())
            }
            Err(e) => {
                error!(%e, "error recovering");
                new_stream.close();
                Err(e)
            }
        }
    }

    async fn try_recover(&self, new_stream: &Arc<Stream>) -> Result<()> {
        // Tell the peer how much of its stream we have; learn the same.
        let header = SequenceHeader {
            sequence_number: self.reader.sequence_number() as i64,
        };
        wire::write_message(new_stream, &header).await?;
        let remote: SequenceHeader = wire::read_message(new_stream, self.max_frame_bytes).await?;
        if remote.sequence_number < 0 {
            return Err(Error::protocol_error(format!(
                "negative sequence number {}",
                remote.sequence_number
            )));
        }

        // Writer stays locked from here until revive, so nothing new can be
        // sent while the catch-up payloads cross.
        let guard = self.writer.begin_recovery().await;
        let catchup = guard.catchup(remote.sequence_number as u64)?;
        wire::write_message(
            new_stream,
            &CatchupBuffer {
                buffer: catchup.to_vec(),
            },
        )
        .await?;
        let remote_catchup: CatchupBuffer =
            wire::read_message(new_stream, self.max_catchup_bytes).await?;

        *self.stream.lock().map_err(Error::from)? = Some(new_stream.clone());
        self.reader.revive(new_stream.clone(), &remote_catchup.buffer);
        guard.revive(new_stream.clone());
        Ok(())
    }

    /// Permanently terminates the connection. Idempotent.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, SeqCst) {
            return;
        }
        info!("shutting down connection");
        self.close_socket().await;
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutting_down.load(SeqCst)
    }

    /// True while the connection has no socket and is waiting for recovery.
    pub fn is_broken(&self) -> bool {
        !self.is_shutdown()
            && self
                .stream
                .lock()
                .map(|guard| guard.is_none())
                .unwrap_or(false)
    }

    /// Completed recoveries over the life of this connection.
    pub fn recovery_count(&self) -> u64 {
        self.recoveries.load(SeqCst)
    }

    pub fn reader_sequence_number(&self) -> u64 {
        self.reader.sequence_number()
    }

    pub async fn writer_sequence_number(&self) -> u64 {
        self.writer.sequence_number().await
    }
}
