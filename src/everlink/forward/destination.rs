use std::io;
use std::sync::Arc;

use tracing::debug;

use crate::everlink::common::Result;
use crate::everlink::config::Settings;
use crate::everlink::net::Stream;
use crate::everlink::proto::PortForwardData;

/// The far end of one tunnel: a socket dialled to the real destination on
/// behalf of the source side's accepted connection. Frames it emits flow
/// destination -> source.
pub struct ForwardDestinationHandler {
    stream: Option<Arc<Stream>>,
    socket_id: i32,
    chunk_bytes: usize,
}

impl ForwardDestinationHandler {
    pub fn new(stream: Arc<Stream>, socket_id: i32, settings: &Settings) -> Self {
        ForwardDestinationHandler {
            stream: Some(stream),
            socket_id,
            chunk_bytes: settings.forward_chunk_bytes,
        }
    }

    pub fn socket_id(&self) -> i32 {
        self.socket_id
    }

    /// Drains whatever the destination socket has ready into frames, one
    /// chunk at a time, stopping at would-block. EOF or a hard error closes
    /// the socket and emits the matching frame.
    pub fn update(&mut self, output: &mut Vec<PortForwardData>) {
        let stream = match &self.stream {
            None => return,
            Some(stream) => stream.clone(),
        };
        let mut buf = vec![0u8; self.chunk_bytes];
        loop {
            match stream.try_read(&mut buf) {
                Ok(0) => {
                    debug!(socket_id = self.socket_id, "destination closed");
                    output.push(PortForwardData::closed(self.socket_id, false));
                    self.close();
                    return;
                }
                Ok(n) => {
                    output.push(PortForwardData::buffer(self.socket_id, false, &buf[..n]));
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!(socket_id = self.socket_id, %e, "destination read error");
                    output.push(PortForwardData::error(self.socket_id, false, e.to_string()));
                    self.close();
                    return;
                }
            }
        }
    }

    /// Writes payload arriving from the source side to the destination.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        match &self.stream {
            None => Ok(()), // already closed; frame was in flight
            Some(stream) => stream.write_all(data).await,
        }
    }

    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }
}
