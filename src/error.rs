use std::fmt::Display;

/// Reftable errors.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// On-disk bytes that do not parse as a reftable: truncation, bad magic,
    /// unknown block types, bad restart markers, CRC mismatches, varint
    /// overflow.
    Format(String),
    /// A writer was closed without any records having been added. Stacks
    /// treat this as a successful no-op.
    EmptyTable,
    /// The stack lockfile is held by another writer, or the on-disk table
    /// list diverged from the in-memory stack. The stack reloads itself; the
    /// caller may retry the transaction.
    LockFailure,
    /// Invalid user input: a malformed ref name, a dir/file conflict with an
    /// existing ref, an update index outside the writer limits, or a
    /// multi-line reflog message where one is not permitted.
    InvalidInput(String),
    /// An IO error.
    Io(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Format(msg) => write!(f, "format error: {msg}"),
            Error::EmptyTable => write!(f, "table is empty"),
            Error::LockFailure => write!(f, "lock failure"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::Format for the given format string.
#[macro_export]
macro_rules! errfmt {
    ($($args:tt)*) => { $crate::error::Error::Format(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// A reftable Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
