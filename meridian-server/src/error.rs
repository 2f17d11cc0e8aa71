//! Server error taxonomy.
//!
//! Every command failure maps to one of these variants; the engine renders
//! them into the connection's output dialect (`{"ok":false,"err":...}` or
//! `-ERR ...`). `GoingLive` is not a failure: it is the control-flow
//! sentinel a FENCE or AOF command uses to hand the connection over to a
//! streaming loop.

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, ServerError>;

#[derive(Error, Debug)]
pub enum ServerError {
    /// Wrong arity for a command
    #[error("invalid number of arguments")]
    InvalidNumArgs,

    /// A specific token failed to parse
    #[error("invalid argument '{0}'")]
    InvalidArgument(String),

    /// The same option token appeared twice
    #[error("duplicate argument '{0}'")]
    DuplicateArgument(String),

    /// Unknown command name
    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("key not found")]
    KeyNotFound,

    #[error("id not found")]
    IdNotFound,

    /// Writes refused while following a leader
    #[error("not the leader")]
    NotLeader,

    #[error("read only")]
    ReadOnly,

    /// Reads refused until the follower catches up
    #[error("catching up to leader")]
    CatchingUp,

    #[error("authentication required")]
    AuthRequired,

    #[error("invalid password")]
    InvalidPassword,

    /// maxmemory exceeded on SET
    #[error("out of memory")]
    OutOfMemory,

    /// AOF framing broken mid-record
    #[error("corrupted aof file")]
    CorruptedLog,

    /// A checksum request ran past the end of the log
    #[error("EOF")]
    Eof,

    /// Generic failure with a message (config, follow preflight, ...)
    #[error("{0}")]
    Other(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Geo(#[from] meridian_geo::GeoError),
}

impl ServerError {
    pub fn other(msg: impl Into<String>) -> Self {
        ServerError::Other(msg.into())
    }

    pub fn invalid_argument(tok: impl Into<String>) -> Self {
        ServerError::InvalidArgument(tok.into())
    }

    /// Errors tolerated while replaying the log: a shrink rewrite can
    /// legitimately leave DELs and FSETs whose targets no longer exist.
    pub fn tolerated_during_load(&self) -> bool {
        matches!(self, ServerError::KeyNotFound | ServerError::IdNotFound)
    }
}
