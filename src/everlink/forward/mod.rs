mod destination;
mod handler;
mod source;

pub use self::destination::ForwardDestinationHandler;
pub use self::handler::PortForwardHandler;
pub use self::source::ForwardSourceHandler;
