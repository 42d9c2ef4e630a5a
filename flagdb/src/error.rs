use std::fmt;

/// The flag store's error taxonomy. Kept as a flat enum (no `thiserror`,
/// matching the rest of this workspace) so callers can match on kind rather
/// than parsing messages.
#[derive(Debug)]
pub enum Error {
    /// Flag length outside [1,100].
    InvalidFlag(String),
    /// `OpenFlag` while a flag is already open.
    FlagAlreadyOpen(Vec<u8>),
    /// `OpenFlag` whose history file already exists on disk.
    FlagFilePreexists(Vec<u8>),
    /// `Commit`/`Cancel`/`SetWithFlag` with no flag open.
    NoOpenFlag,
    /// Supplied flag differs from the open flag, or (for `Rollback`) isn't the head.
    FlagMismatch { expected: Vec<u8>, got: Vec<u8> },
    /// Underlying storage engine error.
    IOFailure(String),
    /// Tenant manager could not be constructed.
    ManagerUnavailable(String),
    /// Bucket-file record or registry value failed to encode/decode.
    Encoding(String),
}

pub type CResult<T> = Result<T, Error>;

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidFlag(msg) => write!(f, "invalid flag: {msg}"),
            Error::FlagAlreadyOpen(flag) => {
                write!(f, "flag already open: {}", hex::encode(flag))
            }
            Error::FlagFilePreexists(flag) => {
                write!(f, "history file already exists for flag: {}", hex::encode(flag))
            }
            Error::NoOpenFlag => write!(f, "no open flag"),
            Error::FlagMismatch { expected, got } => write!(
                f,
                "flag mismatch: expected {}, got {}",
                hex::encode(expected),
                hex::encode(got)
            ),
            Error::IOFailure(msg) => write!(f, "I/O failure: {msg}"),
            Error::ManagerUnavailable(msg) => write!(f, "manager unavailable: {msg}"),
            Error::Encoding(msg) => write!(f, "encoding error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IOFailure(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Encoding(err.to_string())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn display_includes_hex_flag() {
        let err = Error::FlagAlreadyOpen(b"flag1".to_vec());
        assert!(err.to_string().contains(&hex::encode(b"flag1")));
    }
}
