pub mod common;
pub mod config;
pub mod crypto;
pub mod forward;
pub mod link;
pub mod net;
pub mod proto;

pub use common::{Error, ErrorKind, Result};
