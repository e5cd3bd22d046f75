use rusqlite::ErrorCode;
use std::io;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheErrorCode {
    NotFound,
    Closed,
    UnexpectedJournalMode,
    PragmaMismatch,
    OutOfBounds,
    Busy,
    Full,
    Io,
    Sqlite,
    Joined,
}

impl CacheErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheErrorCode::NotFound => "not_found",
            CacheErrorCode::Closed => "closed",
            CacheErrorCode::UnexpectedJournalMode => "unexpected_journal_mode",
            CacheErrorCode::PragmaMismatch => "pragma_mismatch",
            CacheErrorCode::OutOfBounds => "out_of_bounds",
            CacheErrorCode::Busy => "busy",
            CacheErrorCode::Full => "full",
            CacheErrorCode::Io => "io",
            CacheErrorCode::Sqlite => "sqlite",
            CacheErrorCode::Joined => "joined",
        }
    }
}

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("key not found")]
    NotFound,
    #[error("cache closed")]
    Closed,
    #[error("unexpected journal mode: {0:?}")]
    UnexpectedJournalMode(String),
    #[error("pragma {name}: requested {requested:?}, got {actual:?}")]
    PragmaMismatch {
        name: String,
        requested: String,
        actual: String,
    },
    #[error("write out of bounds")]
    OutOfBounds,
    #[error("database busy")]
    Busy,
    #[error("storage full")]
    Full,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("sqlite error: {0}")]
    Sqlite(rusqlite::Error),
    #[error("{first}; also: {second}")]
    Joined {
        first: Box<CacheError>,
        second: Box<CacheError>,
    },
}

impl CacheError {
    pub fn code(&self) -> CacheErrorCode {
        match self {
            CacheError::NotFound => CacheErrorCode::NotFound,
            CacheError::Closed => CacheErrorCode::Closed,
            CacheError::UnexpectedJournalMode(_) => CacheErrorCode::UnexpectedJournalMode,
            CacheError::PragmaMismatch { .. } => CacheErrorCode::PragmaMismatch,
            CacheError::OutOfBounds => CacheErrorCode::OutOfBounds,
            CacheError::Busy => CacheErrorCode::Busy,
            CacheError::Full => CacheErrorCode::Full,
            CacheError::Io(_) => CacheErrorCode::Io,
            CacheError::Sqlite(_) => CacheErrorCode::Sqlite,
            CacheError::Joined { .. } => CacheErrorCode::Joined,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Chains a follow-up failure (usually from a rollback or a close) onto
    /// an earlier one so the caller sees both.
    pub fn join(self, second: CacheError) -> CacheError {
        CacheError::Joined {
            first: Box::new(self),
            second: Box::new(second),
        }
    }
}

impl From<rusqlite::Error> for CacheError {
    fn from(err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            match failure.code {
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => return CacheError::Busy,
                ErrorCode::DiskFull => return CacheError::Full,
                _ => {}
            }
        }
        CacheError::Sqlite(err)
    }
}

// Keeps NotFound identity-compatible with the filesystem's does-not-exist
// error so callers may match on either.
impl From<CacheError> for io::Error {
    fn from(err: CacheError) -> Self {
        let kind = match &err {
            CacheError::NotFound => io::ErrorKind::NotFound,
            CacheError::OutOfBounds => io::ErrorKind::InvalidInput,
            CacheError::Io(inner) => inner.kind(),
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheError, CacheErrorCode};
    use std::io;

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(CacheErrorCode::NotFound.as_str(), "not_found");
        assert_eq!(CacheErrorCode::OutOfBounds.as_str(), "out_of_bounds");
        assert_eq!(
            CacheErrorCode::UnexpectedJournalMode.as_str(),
            "unexpected_journal_mode"
        );
    }

    #[test]
    fn not_found_converts_to_fs_not_found() {
        let io_err: io::Error = CacheError::NotFound.into();
        assert_eq!(io_err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn joined_errors_render_both() {
        let err = CacheError::Full.join(CacheError::Busy);
        assert_eq!(err.code(), CacheErrorCode::Joined);
        let rendered = err.to_string();
        assert!(rendered.contains("storage full"));
        assert!(rendered.contains("database busy"));
    }
}
