use std::{error::Error, fmt, io};

/// The crate's result type.
pub type Result<T> = std::result::Result<T, NetErr>;

/// Construction-time and host-side failures.
///
/// Accelerator resource failures are not represented here: a failed device
/// allocation or copy aborts the process instead of unwinding.
#[derive(Debug)]
pub enum NetErr {
    Io(io::Error),
    /// A stage or buffer was configured with an incompatible length.
    ShapeMismatch {
        what: &'static str,
        got: usize,
        expected: usize,
    },
    /// A chain or hyperparameter precondition was violated.
    InvalidConfig(&'static str),
}

impl fmt::Display for NetErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetErr::Io(e) => write!(f, "io error: {e}"),
            NetErr::ShapeMismatch {
                what,
                got,
                expected,
            } => write!(f, "shape mismatch for {what}: got {got}, expected {expected}"),
            NetErr::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl Error for NetErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            NetErr::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for NetErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<NetErr> for io::Error {
    fn from(value: NetErr) -> Self {
        match value {
            NetErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
