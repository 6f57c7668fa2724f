mod stream;

#[cfg(test)]
pub mod fake;

pub use self::stream::{
    dial_endpoint, listen_endpoint, tcp_dialer, Dialer, Listener, Stream,
};
