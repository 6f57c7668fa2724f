//! Length-prefixed message I/O straight on a socket, with no encryption and
//! no replay protection. This is the framing used before a connection is
//! established: the identity exchange and the recovery handshake. Everything
//! after that flows through Connection, which layers the same framing over
//! the resilient encrypted stream.

use bytes::{BufMut, BytesMut};
use prost::Message;

use crate::everlink::common::{Error, Result};
use crate::everlink::net::Stream;
use crate::everlink::proto::packet::{check_frame_length, LENGTH_PREFIX_BYTES};

pub async fn write_message<M: Message>(stream: &Stream, msg: &M) -> Result<()> {
    let body = msg.encode_to_vec();
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    buf.put_i64_le(body.len() as i64);
    buf.extend_from_slice(&body);
    stream.write_all(&buf).await
}

pub async fn read_message<M: Message + Default>(
    stream: &Stream,
    max_frame_bytes: usize,
) -> Result<M> {
    let mut len_buf = [0u8; LENGTH_PREFIX_BYTES];
    stream.read_exact(&mut len_buf).await?;
    let length = check_frame_length(i64::from_le_bytes(len_buf), max_frame_bytes)?;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    M::decode(body.as_slice()).map_err(Error::from)
}
