mod errors;

pub use self::errors::{is_transient_io, Error, ErrorKind, Result};
