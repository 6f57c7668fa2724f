use std::fmt;
use std::io;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;
use tracing::{debug, error};

use crate::everlink::common::{Error, Result};
use crate::everlink::proto::SocketEndpoint;

#[cfg(test)]
use crate::everlink::net::fake::{FakeListener, FakeStream};

enum StreamKind {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
    #[cfg(test)]
    Fake(FakeStream),
}

/// One live socket. Readiness methods take &self so the stream can be shared
/// between a reader half and a writer half; close() flips a sentinel and
/// wakes any blocked readiness wait instead of needing &mut access. The
/// underlying descriptor is released when the last Arc drops.
pub struct Stream {
    kind: StreamKind,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Stream {
    pub fn new_tcp(stream: TcpStream) -> Stream {
        Stream {
            kind: StreamKind::Tcp(stream),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    #[cfg(unix)]
    pub fn new_unix(stream: UnixStream) -> Stream {
        Stream {
            kind: StreamKind::Unix(stream),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    #[cfg(test)]
    pub fn new_fake(stream: FakeStream) -> Stream {
        Stream {
            kind: StreamKind::Fake(stream),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    /// Marks the stream unusable and wakes every task blocked in readable()
    /// or writable(). Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, SeqCst) {
            return;
        }
        #[cfg(test)]
        if let StreamKind::Fake(f) = &self.kind {
            f.close();
        }
        self.close_notify.notify_waiters();
        debug!(stream = ?self, "closed stream");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(SeqCst)
    }

    pub async fn readable(&self) -> Result<()> {
        // Create the notified future before checking the flag so a close
        // landing in between cannot slip past unobserved.
        let closed = self.close_notify.notified();
        if self.is_closed() {
            return Err(Error::closed());
        }
        tokio::select! {
            _ = closed => Err(Error::closed()),
            r = self.kind_readable() => r,
        }
    }

    pub async fn writable(&self) -> Result<()> {
        let closed = self.close_notify.notified();
        if self.is_closed() {
            return Err(Error::closed());
        }
        tokio::select! {
            _ = closed => Err(Error::closed()),
            r = self.kind_writable() => r,
        }
    }

    async fn kind_readable(&self) -> Result<()> {
        match &self.kind {
            StreamKind::Tcp(s) => s.readable().await.map_err(Error::from),
            #[cfg(unix)]
            StreamKind::Unix(s) => s.readable().await.map_err(Error::from),
            #[cfg(test)]
            StreamKind::Fake(s) => s.readable().await,
        }
    }

    async fn kind_writable(&self) -> Result<()> {
        match &self.kind {
            StreamKind::Tcp(s) => s.writable().await.map_err(Error::from),
            #[cfg(unix)]
            StreamKind::Unix(s) => s.writable().await.map_err(Error::from),
            #[cfg(test)]
            StreamKind::Fake(s) => s.writable().await,
        }
    }

    /// True if a read right now would not block (data, EOF, or an error to
    /// observe). Never blocks.
    pub fn is_readable_now(&self) -> bool {
        self.readable().now_or_never().is_some()
    }

    pub fn try_read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if self.is_closed() {
            // Reads on an invalidated stream observe EOF
            return Ok(0);
        }
        match &self.kind {
            StreamKind::Tcp(s) => s.try_read(buf),
            #[cfg(unix)]
            StreamKind::Unix(s) => s.try_read(buf),
            #[cfg(test)]
            StreamKind::Fake(s) => s.try_read(buf),
        }
    }

    pub fn try_write(&self, buf: &[u8]) -> io::Result<usize> {
        if self.is_closed() {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        match &self.kind {
            StreamKind::Tcp(s) => s.try_write(buf),
            #[cfg(unix)]
            StreamKind::Unix(s) => s.try_write(buf),
            #[cfg(test)]
            StreamKind::Fake(s) => s.try_write(buf),
        }
    }

    /// Reads exactly buf.len() bytes or fails. Used for the plaintext
    /// handshake frames; EOF partway through is an error.
    pub async fn read_exact(&self, buf: &mut [u8]) -> Result<()> {
        let mut pos = 0;
        while pos < buf.len() {
            self.readable().await?;
            match self.try_read(&mut buf[pos..]) {
                Ok(0) => return Err(Error::closed()),
                Ok(n) => pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }

    pub async fn write_all(&self, data: &[u8]) -> Result<()> {
        let mut pos = 0;
        while pos < data.len() {
            self.writable().await?;
            match self.try_write(&data[pos..]) {
                Ok(0) => return Err(Error::closed()),
                Ok(n) => pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(Error::from(e)),
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind = match &self.kind {
            StreamKind::Tcp(..) => "tcp",
            #[cfg(unix)]
            StreamKind::Unix(..) => "unix",
            #[cfg(test)]
            StreamKind::Fake(..) => "fake",
        };
        write!(f, "Stream({}, closed={})", kind, self.is_closed())
    }
}

pub enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener),
    #[cfg(test)]
    Fake(FakeListener),
}

impl Listener {
    pub async fn bind_tcp(host: &str, port: u16) -> Result<Listener> {
        let listener = TcpListener::bind((host, port)).await.map_err(Error::from)?;
        Ok(Listener::Tcp(listener))
    }

    #[cfg(unix)]
    pub fn bind_unix(path: &str) -> Result<Listener> {
        let listener = UnixListener::bind(path).map_err(Error::from)?;
        Ok(Listener::Unix(listener))
    }

    /// Port actually bound, for listeners created with port 0.
    pub fn local_port(&self) -> Option<u16> {
        match self {
            Listener::Tcp(l) => l.local_addr().ok().map(|a| a.port()),
            #[cfg(unix)]
            Listener::Unix(..) => None,
            #[cfg(test)]
            Listener::Fake(..) => None,
        }
    }

    pub async fn accept(&self) -> Result<Stream> {
        match self {
            Listener::Tcp(listener) => loop {
                match listener.accept().await {
                    Ok((sock, remote_addr)) => {
                        debug!(%remote_addr, "accepted connection");
                        return Ok(Stream::new_tcp(sock));
                    }
                    Err(e) => {
                        // Retry only on the known recoverable accept errors.
                        match e.raw_os_error().unwrap_or(0) {
                            libc::ECONNABORTED |
                            libc::EMFILE | // process file-descriptor limit
                            libc::ENFILE | // system wide file-descriptor limit
                            libc::ENOBUFS | // out of memory
                            libc::ENOMEM | // out of memory
                            libc::EPROTO | // protocol error
                            libc::EINTR => {
                                error!(%e, "accept error");
                                continue;
                            }
                            _ => return Err(Error::from(e)),
                        }
                    }
                }
            },
            #[cfg(unix)]
            Listener::Unix(listener) => {
                let (sock, _) = listener.accept().await.map_err(Error::from)?;
                Ok(Stream::new_unix(sock))
            }
            #[cfg(test)]
            Listener::Fake(listener) => listener.accept().await,
        }
    }
}

/// How a client (re)establishes its socket. Injected so tests can swap in a
/// fake network, and so callers can add their own dial policy.
pub type Dialer = Arc<dyn Fn() -> BoxFuture<'static, Result<Stream>> + Send + Sync>;

pub fn tcp_dialer(host: &str, port: u16) -> Dialer {
    let host = host.to_string();
    Arc::new(move || {
        let host = host.clone();
        async move {
            let sock = TcpStream::connect((host.as_str(), port))
                .await
                .map_err(Error::from)?;
            Ok(Stream::new_tcp(sock))
        }
        .boxed()
    })
}

/// Dials a forward destination. Loopback TCP destinations try the IPv6
/// loopback first and fall back to IPv4.
pub async fn dial_endpoint(endpoint: &SocketEndpoint) -> Result<Stream> {
    match (endpoint.name.as_deref(), endpoint.port) {
        (_, Some(port)) if port > u16::MAX as u32 => Err(Error::protocol_error(format!(
            "port {} out of range",
            port
        ))),
        (name, Some(port)) => {
            let port = port as u16;
            match name {
                Some(host) if host != "localhost" => {
                    let sock = TcpStream::connect((host, port)).await.map_err(Error::from)?;
                    Ok(Stream::new_tcp(sock))
                }
                _ => match TcpStream::connect(("::1", port)).await {
                    Ok(sock) => Ok(Stream::new_tcp(sock)),
                    Err(_) => {
                        let sock = TcpStream::connect(("127.0.0.1", port))
                            .await
                            .map_err(Error::from)?;
                        Ok(Stream::new_tcp(sock))
                    }
                },
            }
        }
        #[cfg(unix)]
        (Some(path), None) => {
            let sock = UnixStream::connect(path).await.map_err(Error::from)?;
            Ok(Stream::new_unix(sock))
        }
        _ => Err(Error::protocol_error(format!(
            "cannot dial endpoint {}",
            endpoint
        ))),
    }
}

/// Binds a listener for a forward source endpoint.
pub async fn listen_endpoint(endpoint: &SocketEndpoint) -> Result<Listener> {
    match (endpoint.name.as_deref(), endpoint.port) {
        (_, Some(port)) if port > u16::MAX as u32 => Err(Error::protocol_error(format!(
            "port {} out of range",
            port
        ))),
        (name, Some(port)) => {
            let host = match name {
                Some(host) if host != "localhost" => host,
                _ => "127.0.0.1",
            };
            Listener::bind_tcp(host, port as u16).await
        }
        #[cfg(unix)]
        (Some(path), None) => Listener::bind_unix(path),
        _ => Err(Error::protocol_error(format!(
            "cannot listen on endpoint {}",
            endpoint
        ))),
    }
}
