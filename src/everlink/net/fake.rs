//! An in-memory stand-in for the real network, used by the integration
//! tests: a duplex stream pair with an optional fault injector that fails a
//! configurable fraction of reads and writes the way a flaky link would, a
//! listener fed by its matching dialer, and nothing else.

use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use futures::FutureExt;
use rand::Rng;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;

use crate::everlink::common::{Error, Result};
use crate::everlink::net::{Dialer, Listener, Stream};

/// Fails one in `one_in` calls with a synthetic connection reset / broken
/// pipe. 0 disables injection.
#[derive(Clone, Copy)]
pub struct FaultInjector {
    one_in: u32,
}

impl FaultInjector {
    pub fn new(one_in: u32) -> FaultInjector {
        FaultInjector { one_in }
    }

    fn should_fail(&self) -> bool {
        self.one_in != 0 && rand::thread_rng().gen_ratio(1, self.one_in)
    }
}

struct Inbox {
    data: Mutex<BytesMut>,
    closed: AtomicBool,
    readable: Notify,
}

impl Inbox {
    fn new() -> Arc<Inbox> {
        Arc::new(Inbox {
            data: Mutex::new(BytesMut::new()),
            closed: AtomicBool::new(false),
            readable: Notify::new(),
        })
    }

    fn close(&self) {
        self.closed.store(true, SeqCst);
        self.readable.notify_waiters();
    }
}

pub struct FakeStream {
    rx: Arc<Inbox>, // what the peer wrote to us
    tx: Arc<Inbox>, // the peer's rx
    fault: FaultInjector,
}

impl FakeStream {
    pub fn pair() -> (FakeStream, FakeStream) {
        FakeStream::flaky_pair(0)
    }

    /// Both ends fail one in `one_in` reads/writes (0 = reliable).
    pub fn flaky_pair(one_in: u32) -> (FakeStream, FakeStream) {
        let a = Inbox::new();
        let b = Inbox::new();
        let fault = FaultInjector::new(one_in);
        (
            FakeStream {
                rx: a.clone(),
                tx: b.clone(),
                fault,
            },
            FakeStream {
                rx: b,
                tx: a,
                fault,
            },
        )
    }

    /// Closing either end closes both directions, like a TCP RST: the peer
    /// observes EOF on read and a broken pipe on write.
    pub(crate) fn close(&self) {
        self.rx.close();
        self.tx.close();
    }

    pub async fn readable(&self) -> Result<()> {
        loop {
            // Register for the wakeup before checking, so a notify between
            // the check and the await is not lost.
            let notified = self.rx.readable.notified();
            {
                let data = self.rx.data.lock().map_err(Error::from)?;
                if !data.is_empty() || self.rx.closed.load(SeqCst) {
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    pub async fn writable(&self) -> Result<()> {
        // The in-memory inbox is unbounded, so writes never block.
        Ok(())
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.fault.should_fail() {
            return Err(io::Error::from(io::ErrorKind::ConnectionReset));
        }
        let mut data = self.rx.data.lock().unwrap();
        if data.is_empty() {
            if self.rx.closed.load(SeqCst) {
                return Ok(0); // EOF
            }
            return Err(io::Error::from(io::ErrorKind::WouldBlock));
        }
        let n = buf.len().min(data.len());
        buf[..n].copy_from_slice(&data[..n]);
        data.advance(n);
        Ok(n)
    }

    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.fault.should_fail() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if self.tx.closed.load(SeqCst) {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        let mut data = self.tx.data.lock().unwrap();
        data.extend_from_slice(buf);
        self.tx.readable.notify_waiters();
        Ok(buf.len())
    }
}

pub struct FakeListener {
    incoming: tokio::sync::Mutex<UnboundedReceiver<Stream>>,
}

impl FakeListener {
    pub async fn accept(&self) -> Result<Stream> {
        let mut incoming = self.incoming.lock().await;
        incoming.recv().await.ok_or_else(Error::closed)
    }
}

/// A listener and the dialer that reaches it. Every dial mints a fresh
/// stream pair with the given fault rate, hands one end to the listener, and
/// returns the other, which is all a reconnecting client needs.
pub fn fake_network(fault_one_in: u32) -> (Listener, Dialer) {
    let (sender, receiver): (UnboundedSender<Stream>, UnboundedReceiver<Stream>) =
        unbounded_channel();
    let listener = Listener::Fake(FakeListener {
        incoming: tokio::sync::Mutex::new(receiver),
    });
    let dialer: Dialer = Arc::new(move || {
        let sender = sender.clone();
        async move {
            let (client_end, server_end) = FakeStream::flaky_pair(fault_one_in);
            sender
                .send(Stream::new_fake(server_end))
                .map_err(|_| Error::new("fake listener is gone"))?;
            Ok(Stream::new_fake(client_end))
        }
        .boxed()
    });
    (listener, dialer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_shuttles_bytes() {
        let (a, b) = FakeStream::pair();
        assert_eq!(a.try_write(b"hello").unwrap(), 5);
        b.readable().await.unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.try_read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
        // empty again
        assert_eq!(
            b.try_read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::WouldBlock
        );
    }

    #[tokio::test]
    async fn test_close_gives_peer_eof() {
        let (a, b) = FakeStream::pair();
        a.close();
        let mut buf = [0u8; 4];
        assert_eq!(b.try_read(&mut buf).unwrap(), 0);
        assert_eq!(
            b.try_write(b"x").unwrap_err().kind(),
            io::ErrorKind::BrokenPipe
        );
    }

    #[tokio::test]
    async fn test_fault_injection_fires() {
        let (a, _b) = FakeStream::flaky_pair(2);
        let mut failures = 0;
        for _ in 0..200 {
            if a.try_write(b"x").is_err() {
                failures += 1;
            }
        }
        // one-in-two: overwhelmingly likely to see both outcomes
        assert!(failures > 0 && failures < 200);
    }

    #[tokio::test]
    async fn test_fake_network_dial_reaches_listener() {
        let (listener, dialer) = fake_network(0);
        let client = (dialer)().await.unwrap();
        let server = listener.accept().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }
}
