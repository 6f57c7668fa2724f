use std::fmt::{Debug, Display};
use std::{fmt, io, result};
use std::net::AddrParseError;
use std::sync::PoisonError;

#[derive(Debug, PartialEq, Eq)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    /// The socket (or the whole connection) is closed.
    ClosedError,
    /// The connection was shut down while an operation was in flight.
    ShutdownError,
    PoisonError,
    /// The peer sent something that violates the wire protocol.
    ProtocolError(String),
    /// Recovery cannot proceed; the connection is unrecoverable.
    RecoveryError(String),
    StringError(String),
    IOError(io::Error),
    YAMLError(serde_yaml::Error),
    DecodeError(prost::DecodeError),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn shutdown() -> Self {
        Error {
            err: Box::new(ErrorKind::ShutdownError),
        }
    }

    pub fn protocol_error<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::ProtocolError(s.to_string())),
        }
    }

    pub fn recovery_error<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::RecoveryError(s.to_string())),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// Returns true if this error means the socket was severed and the
    /// resilient layer should absorb it: close the socket, report nothing to
    /// the caller, and let recovery replay whatever was lost.
    pub fn is_transient(&self) -> bool {
        match self.kind() {
            ErrorKind::ClosedError => true,
            ErrorKind::IOError(e) => is_transient_io(e),
            _ => false,
        }
    }

    /// Returns true for the would-block case of a non-blocking read or write.
    pub fn is_would_block(&self) -> bool {
        match self.kind() {
            ErrorKind::IOError(e) => e.kind() == io::ErrorKind::WouldBlock,
            _ => false,
        }
    }
}

/// The skippable-error set: a read or write that fails with one of these means
/// the connection was severed, not that the caller did anything wrong.
pub fn is_transient_io(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::TimedOut
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::UnexpectedEof => true,
        _ => matches!(
            e.raw_os_error().unwrap_or(0),
            libc::ECONNRESET
                | libc::ETIMEDOUT
                | libc::EAGAIN
                | libc::EPIPE
                | libc::EHOSTUNREACH
        ),
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error {
            err: Box::new(ErrorKind::DecodeError(err)),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::new(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error {
            err: Box::new(ErrorKind::PoisonError),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        std::fmt::Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ClosedError => f.write_str("socket is closed"),
            ErrorKind::ShutdownError => f.write_str("connection is shutting down"),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::ProtocolError(s) => write!(f, "protocol violation: {}", s),
            ErrorKind::RecoveryError(s) => write!(f, "recovery failed: {}", s),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::IOError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::YAMLError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::DecodeError(e) => std::fmt::Display::fmt(&e, f),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ErrorKind {}
