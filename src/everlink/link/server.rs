use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fnv::FnvHashMap;
use tokio::sync::Notify;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::everlink::common::{Error, Result};
use crate::everlink::config::Settings;
use crate::everlink::crypto::{Key, CLIENT_TO_SERVER_NONCE, SERVER_TO_CLIENT_NONCE};
use crate::everlink::link::connection::Connection;
use crate::everlink::net::{Listener, Stream};
use crate::everlink::proto::wire;
use crate::everlink::proto::{ConnectRequest, ConnectResponse, NULL_CLIENT_ID};

/// Give up minting a fresh client id after this many collisions.
const MINT_CLIENT_ID_ATTEMPTS: usize = 100000;

/// The server's view of one logical client, stable across any number of
/// underlying sockets. Derefs to Connection for the byte-stream API.
pub struct ServerClientConnection {
    conn: Connection,
    client_id: i32,
}

impl ServerClientConnection {
    fn new(stream: Arc<Stream>, client_id: i32, key: &Key, settings: &Settings) -> Self {
        ServerClientConnection {
            conn: Connection::new(
                stream,
                key,
                CLIENT_TO_SERVER_NONCE,
                SERVER_TO_CLIENT_NONCE,
                settings,
            ),
            client_id,
        }
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// A reviving client showed up on a new socket: drop whatever socket we
    /// still hold and run the recovery handshake on the new one.
    pub async fn recover_client(&self, new_stream: Arc<Stream>) -> Result<()> {
        self.conn.close_socket().await;
        self.conn.recover(new_stream).await
    }
}

impl Deref for ServerClientConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

/// Decides whether a freshly registered client may stay.
pub trait ServerHandler: Send + Sync + 'static {
    /// Return false to reject: the client is removed and its socket closed.
    fn new_client(&self, client: &Arc<ServerClientConnection>) -> bool;
}

/// Owns the listening socket and the registry of connected clients. Each
/// accepted socket is handed to a short-lived task that reads the identity
/// frame and either registers a new client or revives an existing one.
pub struct ServerConnection {
    listener: Listener,
    key: Key,
    settings: Settings,
    handler: Option<Arc<dyn ServerHandler>>,
    clients: Mutex<FnvHashMap<i32, Arc<ServerClientConnection>>>,
    stop: AtomicBool,
    stop_notify: Notify,
}

impl ServerConnection {
    pub fn new(
        listener: Listener,
        key: Key,
        handler: Option<Arc<dyn ServerHandler>>,
        settings: Settings,
    ) -> Arc<ServerConnection> {
        Arc::new(ServerConnection {
            listener,
            key,
            settings,
            handler,
            clients: Mutex::new(FnvHashMap::default()),
            stop: AtomicBool::new(false),
            stop_notify: Notify::new(),
        })
    }

    /// The accept loop. Runs until close() is called.
    pub async fn run(self: Arc<ServerConnection>) {
        loop {
            // Register for the stop wakeup before checking the flag so a
            // close landing in between cannot be missed.
            let stopped = self.stop_notify.notified();
            if self.stop.load(SeqCst) {
                return;
            }
            let accepted = tokio::select! {
                _ = stopped => return,
                accepted = self.listener.accept() => accepted,
            };
            match accepted {
                Ok(stream) => {
                    let server = self.clone();
                    tokio::spawn(async move {
                        server.handle_client(Arc::new(stream)).await;
                    });
                }
                Err(e) => {
                    if self.stop.load(SeqCst) {
                        return;
                    }
                    warn!(%e, "accept failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    /// Stops the accept loop. Registered clients stay up until removed.
    pub fn close(&self) {
        self.stop.store(true, SeqCst);
        self.stop_notify.notify_waiters();
    }

    async fn handle_client(&self, stream: Arc<Stream>) {
        if let Err(e) = self.try_handle_client(&stream).await {
            // Comm failed or the client is unknown; drop the socket.
            error!(%e, "error handling new client");
            stream.close();
        }
    }

    async fn try_handle_client(&self, stream: &Arc<Stream>) -> Result<()> {
        let request: ConnectRequest =
            wire::read_message(stream, self.settings.max_frame_bytes).await?;
        if request.client_id == NULL_CLIENT_ID {
            self.register_client(stream).await
        } else {
            let client = self
                .get_client(request.client_id)
                .ok_or_else(|| Error::protocol_error("tried to revive an unknown client"))?;
            debug!(client_id = request.client_id, "reviving client");
            client.recover_client(stream.clone()).await
        }
    }

    async fn register_client(&self, stream: &Arc<Stream>) -> Result<()> {
        let client_id = self.mint_client_id()?;
        wire::write_message(stream, &ConnectResponse { client_id }).await?;
        let client = Arc::new(ServerClientConnection::new(
            stream.clone(),
            client_id,
            &self.key,
            &self.settings,
        ));
        self.clients
            .lock()
            .map_err(Error::from)?
            .insert(client_id, client.clone());
        info!(client_id, "registered new client");

        if let Some(handler) = &self.handler {
            if !handler.new_client(&client) {
                debug!(client_id, "handler rejected new client");
                self.remove_client(client_id).await;
            }
        }
        Ok(())
    }

    fn mint_client_id(&self) -> Result<i32> {
        let clients = self.clients.lock().map_err(Error::from)?;
        for _ in 0..MINT_CLIENT_ID_ATTEMPTS {
            // non-negative, so it can never collide with NULL_CLIENT_ID
            let candidate = (rand::random::<u32>() >> 1) as i32;
            if !clients.contains_key(&candidate) {
                return Ok(candidate);
            }
        }
        Err(Error::new("ran out of client ids"))
    }

    pub fn get_client(&self, client_id: i32) -> Option<Arc<ServerClientConnection>> {
        self.clients.lock().ok()?.get(&client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Shuts the client down and drops it from the registry.
    pub async fn remove_client(&self, client_id: i32) -> bool {
        let client = match self.clients.lock() {
            Ok(mut clients) => clients.remove(&client_id),
            Err(_) => None,
        };
        match client {
            Some(client) => {
                client.shutdown().await;
                true
            }
            None => false,
        }
    }

    /// Stops accepting and shuts down every registered client.
    pub async fn shutdown(&self) {
        self.close();
        let clients: Vec<_> = match self.clients.lock() {
            Ok(mut guard) => guard.drain().map(|(_, c)| c).collect(),
            Err(_) => return,
        };
        for client in clients {
            client.shutdown().await;
        }
    }
}
