//! Container error type.

/// S4 container error type.
#[derive(Debug, thiserror::Error)]
pub enum S4Error {
    /// Not enough bytes remain in the block for the requested access.
    #[error("short buffer")]
    ShortBuffer,

    /// Seek destination lies outside the block bounds.
    #[error("out of range")]
    OutOfRange,

    /// Input could not be parsed as an S4 document.
    #[error("malformed block: {0}")]
    MalformedBlock(String),
}

/// S4 container result type.
pub type S4Result<T> = Result<T, S4Error>;
