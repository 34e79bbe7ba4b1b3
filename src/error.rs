use thiserror::Error;

/// Failure taxonomy of the core. `NotFound` doubles as an internal signal:
/// an accumulator mismatch while reading the inbox surfaces as `NotFound`
/// and tells the caller a reorg is in progress.
#[derive(Debug, Error)]
pub enum Error {
    #[error("not found")]
    NotFound,
    /// An execution cursor gave up after retrying through too many reorgs.
    #[error("database busy")]
    Busy,
    #[error("storage error: {0}")]
    Storage(#[from] rocksdb::Error),
    /// Invariant violation in persisted data. Callers treat this as fatal.
    #[error("corrupt data: {0}")]
    Corruption(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    #[inline(always)]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound)
    }

    pub fn corrupt(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }
}

impl From<rlp::DecoderError> for Error {
    fn from(e: rlp::DecoderError) -> Self {
        Error::Corruption(format!("rlp decode: {}", e))
    }
}
