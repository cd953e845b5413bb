use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the tar codec and both stream engines.
///
/// Every variant is terminal for the engine that raised it, the engine must be
/// discarded afterwards. The error is `Clone` so the same failure can be handed
/// to the engine caller, the entry receiver and any live entry stream.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Header checksum mismatch or an unparseable header field.
    #[error("invalid tar header: {0}")]
    MalformedHeader(String),

    /// Unknown magic or typeflag while unknown formats are not allowed.
    #[error("unsupported tar format: {0}")]
    UnsupportedFormat(String),

    /// A base-256 numeric field holds a value above the safe integer range.
    #[error("unsafe base-256 numeric encoding")]
    UnsafeNumericEncoding,

    /// Input ended in the middle of a header, extension or body.
    #[error("unexpected end of archive data")]
    TruncatedArchive,

    /// The engine API was driven out of protocol.
    #[error("protocol misuse: {0}")]
    ProtocolMisuse(String),

    /// A packed body did not match its declared size.
    #[error("entry size mismatch: declared {declared} bytes, written {written} bytes")]
    SizeMismatch { declared: u64, written: u64 },

    /// The engine or one of its entry streams was destroyed while still in use.
    #[error("stream destroyed: {0}")]
    Destroyed(String),

    /// Failure of the underlying byte source.
    #[error(transparent)]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        // engine errors travel through AsyncRead wrapped in io errors
        match value.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
            Some(err) => err.clone(),
            None => Self::Io(Arc::new(value)),
        }
    }
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(err) => std::io::Error::new(err.kind(), Error::Io(err)),
            Error::TruncatedArchive => std::io::Error::new(std::io::ErrorKind::UnexpectedEof, value),
            other => std::io::Error::other(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
