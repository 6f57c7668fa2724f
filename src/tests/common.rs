use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::everlink::config::Settings;
use crate::everlink::crypto::Key;
use crate::everlink::link::{ClientConnection, ServerClientConnection, ServerConnection};
use crate::everlink::net::fake::fake_network;
use crate::everlink::net::Dialer;

/// Generous upper bound so a deadlock surfaces as a test failure instead of
/// hanging the suite.
pub const WATCHDOG: Duration = Duration::from_secs(60);

pub fn test_key() -> Key {
    Key::new(b"12345678901234567890123456789012").unwrap()
}

/// Defaults, but with the retry cadences turned way down so reconnect-heavy
/// tests finish quickly.
pub fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.reconnect_interval_ms = 20;
    settings.dead_socket_retry_ms = 5;
    settings
}

pub fn random_letters(count: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..count).map(|_| rng.gen_range(b'A'..=b'Z')).collect()
}

/// Stands up a server on a fake network and returns it with the dialer that
/// reaches it. fault_one_in > 0 makes every socket flaky at that rate.
pub fn start_server(
    fault_one_in: u32,
    settings: Settings,
) -> (Arc<ServerConnection>, Dialer, JoinHandle<()>) {
    let (listener, dialer) = fake_network(fault_one_in);
    let server = ServerConnection::new(listener, test_key(), None, settings);
    let accept_loop = {
        let server = server.clone();
        tokio::spawn(async move { server.run().await })
    };
    (server, dialer, accept_loop)
}

/// Connects, retrying if the flaky transport kills the identity exchange.
pub async fn connect_client(dialer: &Dialer, settings: &Settings) -> ClientConnection {
    loop {
        match ClientConnection::connect(dialer.clone(), &test_key(), settings.clone()).await {
            Ok(client) => return client,
            Err(_) => continue,
        }
    }
}

pub async fn wait_for_client(
    server: &Arc<ServerConnection>,
    client_id: i32,
) -> Arc<ServerClientConnection> {
    loop {
        if let Some(client) = server.get_client(client_id) {
            return client;
        }
        sleep(Duration::from_millis(1)).await;
    }
}
