use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    #[error("unsupported checksum algorithm '{0}'")]
    UnsupportedAlgorithm(String),

    #[error("transport error for {uri}: {message}")]
    Transport { uri: String, message: String },

    #[error("redirect limit exceeded fetching {uri} (more than {limit} hops)")]
    RedirectLimitExceeded { uri: String, limit: usize },

    #[error("unexpected response status {code} from {uri}: {snippet}")]
    UnexpectedResponseStatus {
        uri: String,
        code: u16,
        snippet: String,
    },

    #[error("{uri} did not report a last-modified time")]
    MissingLastModified { uri: String },

    #[error("checksum mismatch for {}: expected {expected}, got {actual}", path.display())]
    ChecksumMismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("conflicting attributes for {}: already declared as {existing}, requested {requested}", path.display())]
    AttributeConflict {
        path: PathBuf,
        existing: String,
        requested: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Msg(String),
}

impl Error {
    pub fn msg<M: Into<String>>(msg: M) -> Self {
        Self::Msg(msg.into())
    }

    pub fn config<M: Into<String>>(msg: M) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    pub fn io<C: Into<String>>(context: C, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    pub fn transport<U: ToString, M: ToString>(uri: U, message: M) -> Self {
        Self::Transport {
            uri: uri.to_string(),
            message: message.to_string(),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::io("I/O error", err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
