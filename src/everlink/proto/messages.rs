//! Wire messages. These are protobuf-compatible (prost); the field numbers
//! are part of the wire contract and must never be renumbered.

use std::fmt;

/// clientId sentinel in a ConnectRequest meaning "I am new, mint me an id".
pub const NULL_CLIENT_ID: i32 = -1;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectRequest {
    /// NULL_CLIENT_ID for a first connect, the server-minted id on reconnect
    #[prost(int32, tag = "1")]
    pub client_id: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ConnectResponse {
    #[prost(int32, tag = "1")]
    pub client_id: i32,
}

/// Sent by each side at the start of recovery: the count of on-the-wire bytes
/// this side has received from the peer. The peer replays everything beyond.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SequenceHeader {
    #[prost(int64, tag = "1")]
    pub sequence_number: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CatchupBuffer {
    #[prost(bytes = "vec", tag = "1")]
    pub buffer: Vec<u8>,
}

/// A TCP endpoint ({name, port}) or a UNIX-socket path ({name} alone).
/// port is uint32 on the wire because protobuf has no 16-bit scalar; values
/// above u16::MAX are invalid.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SocketEndpoint {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(uint32, optional, tag = "2")]
    pub port: Option<u32>,
}

impl SocketEndpoint {
    pub fn tcp(host: &str, port: u16) -> SocketEndpoint {
        SocketEndpoint {
            name: Some(host.to_string()),
            port: Some(port as u32),
        }
    }

    pub fn unix(path: &str) -> SocketEndpoint {
        SocketEndpoint {
            name: Some(path.to_string()),
            port: None,
        }
    }
}

impl fmt::Display for SocketEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (&self.name, self.port) {
            (Some(name), Some(port)) => write!(f, "{}:{}", name, port),
            (Some(name), None) => f.write_str(name),
            (None, Some(port)) => write!(f, "*:{}", port),
            (None, None) => f.write_str("<empty endpoint>"),
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardSourceRequest {
    #[prost(message, optional, tag = "1")]
    pub source: Option<SocketEndpoint>,
    #[prost(message, optional, tag = "2")]
    pub destination: Option<SocketEndpoint>,
    /// When set and no destination is given, the allocated pipe path is
    /// published through this environment variable.
    #[prost(string, optional, tag = "3")]
    pub environment_variable: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardSourceResponse {
    #[prost(string, optional, tag = "1")]
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardDestinationRequest {
    #[prost(message, optional, tag = "1")]
    pub destination: Option<SocketEndpoint>,
    /// A correlator private to the requesting side; echoed back untouched in
    /// the response and never interpreted as a descriptor by the receiver.
    #[prost(int32, tag = "2")]
    pub fd: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardDestinationResponse {
    #[prost(int32, tag = "1")]
    pub client_fd: i32,
    #[prost(int32, optional, tag = "2")]
    pub socket_id: Option<i32>,
    #[prost(string, optional, tag = "3")]
    pub error: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct PortForwardData {
    #[prost(int32, tag = "1")]
    pub socket_id: i32,
    /// true: write the payload to the destination socket; false: to the source
    #[prost(bool, tag = "2")]
    pub source_to_destination: bool,
    #[prost(oneof = "port_forward_data::Body", tags = "3, 4, 5")]
    pub body: Option<port_forward_data::Body>,
}

pub mod port_forward_data {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Body {
        #[prost(bytes, tag = "3")]
        Buffer(Vec<u8>),
        #[prost(bool, tag = "4")]
        Closed(bool),
        #[prost(string, tag = "5")]
        Error(String),
    }
}

impl PortForwardData {
    pub fn buffer(socket_id: i32, source_to_destination: bool, data: &[u8]) -> PortForwardData {
        PortForwardData {
            socket_id,
            source_to_destination,
            body: Some(port_forward_data::Body::Buffer(data.to_vec())),
        }
    }

    pub fn closed(socket_id: i32, source_to_destination: bool) -> PortForwardData {
        PortForwardData {
            socket_id,
            source_to_destination,
            body: Some(port_forward_data::Body::Closed(true)),
        }
    }

    pub fn error(socket_id: i32, source_to_destination: bool, error: String) -> PortForwardData {
        PortForwardData {
            socket_id,
            source_to_destination,
            body: Some(port_forward_data::Body::Error(error)),
        }
    }
}
