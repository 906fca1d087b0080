use thiserror::Error;

/// Why a container or file could not be turned back into plaintext.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    #[error("unsupported chunk key type {0}")]
    UnsupportedKeyType(u8),

    #[error("bad key length: {0} bytes")]
    BadKeyLength(usize),

    #[error("container truncated: need {need} bytes, have {have}")]
    Truncated { need: u64, have: u64 },

    #[error("checksum mismatch in chunk {chunk}")]
    ChecksumMismatch { chunk: usize },

    #[error("ciphertext length {0} is not a multiple of the block size")]
    Misaligned(u64),

    #[error("file too short for trailer ({0} bytes)")]
    TrailerMissing(u64),

    #[error("trailer digest mismatch")]
    TrailerMismatch,
}

#[derive(Error, Debug)]
pub enum SalvageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Format error: {0}")]
    Format(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeFailure),

    #[error("Transport error ({status:?}): {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("Authentication required: {0}")]
    Authentication(String),

    #[error("Snapshot {0} is not available")]
    SnapshotUnavailable(i64),

    #[error("Download cancelled")]
    Cancelled,

    #[error("Worker failed: {0}")]
    Worker(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl SalvageError {
    /// Map an HTTP-style status code onto the error taxonomy.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status == 401 {
            SalvageError::Authentication(message)
        } else {
            SalvageError::Transport {
                status: Some(status),
                message,
            }
        }
    }

    /// Worth another attempt later in the same download.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            SalvageError::Transport { .. } | SalvageError::Decode(_) => true,
            SalvageError::Io(e) => matches!(
                e.kind(),
                ErrorKind::TimedOut
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::BrokenPipe
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Stops the whole worker pool.
    pub fn is_fatal(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            SalvageError::Authentication(_)
            | SalvageError::Cancelled
            | SalvageError::Worker(_) => true,
            SalvageError::Io(e) => matches!(
                e.kind(),
                ErrorKind::StorageFull | ErrorKind::ReadOnlyFilesystem | ErrorKind::Interrupted
            ),
            _ => false,
        }
    }
}

// Convenient crate-wide result type
pub type Result<T> = std::result::Result<T, SalvageError>;
