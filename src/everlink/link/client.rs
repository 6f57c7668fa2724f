use std::ops::Deref;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::everlink::common::{ErrorKind, Result};
use crate::everlink::config::Settings;
use crate::everlink::crypto::{Key, CLIENT_TO_SERVER_NONCE, SERVER_TO_CLIENT_NONCE};
use crate::everlink::link::connection::Connection;
use crate::everlink::net::{Dialer, Stream};
use crate::everlink::proto::wire;
use crate::everlink::proto::{ConnectRequest, ConnectResponse, NULL_CLIENT_ID};

/// The client endpoint: dials the server, announces itself with the null id,
/// remembers the id the server mints, and keeps a background task polling to
/// re-dial and recover whenever the connection breaks. Derefs to Connection
/// for the byte-stream API.
pub struct ClientConnection {
    conn: Arc<Connection>,
    client_id: i32,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClientConnection {
    /// First-time connect: dial, exchange identity, stand up fresh codecs,
    /// then start the reconnect poller.
    pub async fn connect(dialer: Dialer, key: &Key, settings: Settings) -> Result<ClientConnection> {
        debug!("connecting");
        let stream = Arc::new((dialer)().await?);
        let client_id = match Self::exchange_identity(&stream, settings.max_frame_bytes).await {
            Ok(id) => id,
            Err(e) => {
                stream.close();
                return Err(e);
            }
        };
        info!(client_id, "client connection established");

        let conn = Arc::new(Connection::new(
            stream,
            key,
            SERVER_TO_CLIENT_NONCE,
            CLIENT_TO_SERVER_NONCE,
            &settings,
        ));
        let reconnect_task = tokio::spawn(poll_reconnect(
            conn.clone(),
            dialer,
            client_id,
            Duration::from_millis(settings.reconnect_interval_ms),
        ));
        Ok(ClientConnection {
            conn,
            client_id,
            reconnect_task: Mutex::new(Some(reconnect_task)),
        })
    }

    async fn exchange_identity(stream: &Stream, max_frame_bytes: usize) -> Result<i32> {
        wire::write_message(
            stream,
            &ConnectRequest {
                client_id: NULL_CLIENT_ID,
            },
        )
        .await?;
        let response: ConnectResponse = wire::read_message(stream, max_frame_bytes).await?;
        Ok(response.client_id)
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.conn
    }

    /// Terminates the connection and stops the reconnect poller.
    pub async fn shutdown(&self) {
        self.conn.shutdown().await;
        let task = self.reconnect_task.lock().unwrap().take();
        if let Some(task) = task {
            // The poller may be mid-sleep; don't wait out the interval.
            task.abort();
        }
    }
}

impl Deref for ClientConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl Drop for ClientConnection {
    fn drop(&mut self) {
        if let Ok(mut guard) = self.reconnect_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
    }
}

/// Runs until shutdown: whenever the connection is broken, dial, re-announce
/// our identity, and run recovery; sleep between attempts either way.
async fn poll_reconnect(
    conn: Arc<Connection>,
    dialer: Dialer,
    client_id: i32,
    interval: Duration,
) {
    loop {
        if conn.is_shutdown() {
            return;
        }
        if conn.is_broken() {
            debug!(client_id, "trying to reconnect");
            match (dialer)().await {
                Ok(stream) => {
                    let stream = Arc::new(stream);
                    let result = async {
                        wire::write_message(&stream, &ConnectRequest { client_id }).await?;
                        conn.recover(stream.clone()).await
                    }
                    .await;
                    if let Err(e) = result {
                        stream.close();
                        if matches!(e.kind(), ErrorKind::RecoveryError(_)) {
                            // Replay window exceeded or sequence numbers
                            // disagree; no future dial can fix that.
                            error!(%e, client_id, "connection is unrecoverable, shutting down");
                            conn.shutdown().await;
                            return;
                        }
                        warn!(%e, client_id, "reconnect attempt failed");
                    }
                }
                Err(e) => debug!(%e, client_id, "dial failed, waiting to retry"),
            }
        }
        sleep(interval).await;
    }
}
