mod messages;
mod packet;
pub mod wire;

pub use messages::*;
pub use packet::*;
