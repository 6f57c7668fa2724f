use std::io;
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::everlink::common::Result;
use crate::everlink::config::Settings;
use crate::everlink::net::{Listener, Stream};
use crate::everlink::proto::{PortForwardData, PortForwardDestinationRequest, SocketEndpoint};

/// The near end of a tunnel group: listens on one local endpoint, and for
/// every connection it accepts asks the peer to open the matching destination
/// socket. Until the peer answers with a socket id, an accepted connection is
/// tracked only by a local fd correlator; the peer echoes that correlator
/// back, never interprets it. Frames this side emits flow
/// source -> destination.
pub struct ForwardSourceHandler {
    source: SocketEndpoint,
    destination: SocketEndpoint,
    /// accepted by the listener task, not yet picked up by a polling tick
    pending: Arc<Mutex<Vec<Arc<Stream>>>>,
    accept_task: JoinHandle<()>,
    /// fd correlator -> accepted connection awaiting its socket id
    unassigned: FnvHashMap<i32, Arc<Stream>>,
    /// socket id -> forwarding connection
    sockets: FnvHashMap<i32, Arc<Stream>>,
    next_fd: i32,
    chunk_bytes: usize,
}

impl ForwardSourceHandler {
    pub fn new(
        listener: Listener,
        source: SocketEndpoint,
        destination: SocketEndpoint,
        settings: &Settings,
    ) -> Self {
        let pending: Arc<Mutex<Vec<Arc<Stream>>>> = Arc::new(Mutex::new(Vec::new()));
        let accept_pending = pending.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok(stream) => accept_pending.lock().unwrap().push(Arc::new(stream)),
                    Err(e) => {
                        debug!(%e, "source listener stopped");
                        return;
                    }
                }
            }
        });
        ForwardSourceHandler {
            source,
            destination,
            pending,
            accept_task,
            unassigned: FnvHashMap::default(),
            sockets: FnvHashMap::default(),
            next_fd: 1,
            chunk_bytes: settings.forward_chunk_bytes,
        }
    }

    pub fn source(&self) -> &SocketEndpoint {
        &self.source
    }

    pub fn destination(&self) -> &SocketEndpoint {
        &self.destination
    }

    /// Picks up connections the listener accepted since the last tick and
    /// emits one destination request per connection.
    pub fn accept_new_connections(&mut self) -> Vec<PortForwardDestinationRequest> {
        let accepted: Vec<Arc<Stream>> = self.pending.lock().unwrap().drain(..).collect();
        let mut requests = Vec::with_capacity(accepted.len());
        for stream in accepted {
            let fd = self.next_fd;
            self.next_fd += 1;
            debug!(fd, destination = %self.destination, "accepted tunnel connection");
            self.unassigned.insert(fd, stream);
            requests.push(PortForwardDestinationRequest {
                destination: Some(self.destination.clone()),
                fd,
            });
        }
        requests
    }

    pub fn has_unassigned_fd(&self, fd: i32) -> bool {
        self.unassigned.contains_key(&fd)
    }

    /// The peer couldn't open a destination for this fd: drop the accepted
    /// connection.
    pub fn close_unassigned_fd(&mut self, fd: i32) {
        if let Some(stream) = self.unassigned.remove(&fd) {
            stream.close();
        }
    }

    /// The peer opened a destination: bind the accepted connection to its
    /// socket id and start forwarding. Returns false if the fd is unknown.
    pub fn add_socket(&mut self, socket_id: i32, fd: i32) -> bool {
        match self.unassigned.remove(&fd) {
            Some(stream) => {
                self.sockets.insert(socket_id, stream);
                true
            }
            None => {
                warn!(socket_id, fd, "socket id for an unknown fd");
                false
            }
        }
    }

    pub fn contains_socket(&self, socket_id: i32) -> bool {
        self.sockets.contains_key(&socket_id)
    }

    /// Drains readable data from every bound connection into frames; EOF or a
    /// hard error emits the matching frame and prunes the entry.
    pub fn update(&mut self, output: &mut Vec<PortForwardData>) {
        let mut buf = vec![0u8; self.chunk_bytes];
        let mut finished: Vec<i32> = Vec::new();
        for (&socket_id, stream) in self.sockets.iter() {
            loop {
                match stream.try_read(&mut buf) {
                    Ok(0) => {
                        debug!(socket_id, "tunnel connection closed locally");
                        output.push(PortForwardData::closed(socket_id, true));
                        finished.push(socket_id);
                        break;
                    }
                    Ok(n) => {
                        output.push(PortForwardData::buffer(socket_id, true, &buf[..n]));
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        debug!(socket_id, %e, "tunnel connection read error");
                        output.push(PortForwardData::error(socket_id, true, e.to_string()));
                        finished.push(socket_id);
                        break;
                    }
                }
            }
        }
        for socket_id in finished {
            self.close_socket(socket_id);
        }
    }

    /// Writes payload arriving from the destination side to the bound
    /// connection.
    pub async fn send_data(&self, socket_id: i32, data: &[u8]) -> Result<()> {
        match self.sockets.get(&socket_id) {
            Some(stream) => stream.write_all(data).await,
            None => {
                debug!(socket_id, "data for an unknown socket id");
                Ok(())
            }
        }
    }

    pub fn close_socket(&mut self, socket_id: i32) {
        if let Some(stream) = self.sockets.remove(&socket_id) {
            stream.close();
        }
    }
}

impl Drop for ForwardSourceHandler {
    /// Stops listening and closes every connection this handler still owns.
    fn drop(&mut self) {
        self.accept_task.abort();
        for stream in self.pending.lock().unwrap().drain(..) {
            stream.close();
        }
        for (_, stream) in self.unassigned.drain() {
            stream.close();
        }
        for (_, stream) in self.sockets.drain() {
            stream.close();
        }
    }
}
