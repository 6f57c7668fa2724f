mod backed_reader;
mod backed_writer;
mod client;
mod connection;
mod server;

pub use self::backed_reader::BackedReader;
pub use self::backed_writer::{BackedWriter, RecoveryGuard, WriteOutcome};
pub use self::client::ClientConnection;
pub use self::connection::Connection;
pub use self::server::{ServerClientConnection, ServerConnection, ServerHandler};
