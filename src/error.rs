use std::io;
use thiserror::Error;

/// Everything that can go wrong while encoding or decoding a container.
///
/// The variants distinguish "not this format / corrupted" (`CorruptedInput`),
/// "this format but options we cannot handle" (`UnsupportedFilterChain`),
/// and "payload decoded fully but the digest disagrees" (`IntegrityMismatch`).
/// A session that has raised any of these is terminal; subsequent calls on it
/// re-raise the same error instead of touching the underlying I/O again.
#[derive(Error, Debug, Clone)]
pub enum XzError {
    #[error("malformed variable-length integer")]
    MalformedVli,

    #[error("unsupported filter chain: {0}")]
    UnsupportedFilterChain(String),

    #[error("corrupted input: {0}")]
    CorruptedInput(String),

    #[error("integrity check ({check}) does not match")]
    IntegrityMismatch { check: &'static str },

    #[error("memory usage limit exceeded: {needed_kib} KiB needed, {limit_kib} KiB allowed")]
    MemoryLimitExceeded { needed_kib: u64, limit_kib: u64 },

    #[error("unexpected end of input: {0}")]
    UnexpectedEof(String),

    #[error("I/O error: {1}")]
    Io(io::ErrorKind, String),
}

impl From<io::Error> for XzError {
    fn from(e: io::Error) -> Self {
        // If the io::Error was produced from an XzError (the Read/Write impls
        // wrap them), unwrap it so the original kind survives the round trip.
        if e.get_ref().map_or(false, |r| r.is::<XzError>()) {
            return *e.into_inner().unwrap().downcast::<XzError>().unwrap();
        }
        match e.kind() {
            io::ErrorKind::UnexpectedEof => {
                XzError::UnexpectedEof("input ended in the middle of a structure".to_string())
            }
            kind => XzError::Io(kind, e.to_string()),
        }
    }
}

impl From<XzError> for io::Error {
    fn from(e: XzError) -> Self {
        let kind = match &e {
            XzError::UnexpectedEof(_) => io::ErrorKind::UnexpectedEof,
            XzError::Io(kind, _) => *kind,
            _ => io::ErrorKind::InvalidData,
        };
        io::Error::new(kind, e)
    }
}

/// Recover the [`XzError`] carried inside an `io::Error`, if any.
pub fn as_xz_error(e: &io::Error) -> Option<&XzError> {
    e.get_ref().and_then(|r| r.downcast_ref::<XzError>())
}
