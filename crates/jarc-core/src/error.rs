use thiserror::Error;

pub type Result<T> = std::result::Result<T, JarcError>;

#[derive(Debug, Error)]
pub enum JarcError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad archive: {0}")]
    BadArchive(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("size mismatch: {0}")]
    SizeMismatch(String),

    #[error("missing fragment {0}")]
    MissingFragment(u32),

    #[error("duplicate fragment ID {0}")]
    DuplicateFragmentId(u32),

    #[error("incomplete transaction")]
    TransactionIncomplete,

    #[error("file exists, will not clobber without --force: '{0}'")]
    Clobber(String),

    #[error("bad option: {0}")]
    BadOption(String),

    #[error("decompression error: {0}")]
    Decompression(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("{0}")]
    Other(String),
}

impl JarcError {
    /// Errors that may be contained at a block boundary: the reader logs,
    /// counts, and resumes at the next block instead of aborting.
    pub fn is_block_recoverable(&self) -> bool {
        matches!(
            self,
            JarcError::BadArchive(_)
                | JarcError::ChecksumMismatch(_)
                | JarcError::SizeMismatch(_)
                | JarcError::Decompression(_)
                | JarcError::DuplicateFragmentId(_)
                | JarcError::MissingFragment(_)
        )
    }
}
