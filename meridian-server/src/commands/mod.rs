//! Command handlers, grouped the way the protocol groups them.

pub mod admin;
pub mod crud;
pub mod hooks;
pub mod scan;
pub mod search;

use std::time::Instant;

use crate::db::{CommandDetails, Db, Undo};
use crate::error::{Result, ServerError};
use crate::protocol::{Message, Reply};

/// Result of an in-memory write: the reply, the mutation record for the
/// log and dispatcher (when state changed), and the undo used by the
/// synchronous hook mode.
pub struct WriteResult {
    pub reply: Reply,
    pub details: Option<CommandDetails>,
    pub undo: Undo,
    /// Whether the command is appended to the log. An idempotent SETHOOK
    /// replay leaves this false.
    pub append: bool,
}

impl WriteResult {
    pub fn new(reply: Reply, details: Option<CommandDetails>, undo: Undo) -> WriteResult {
        WriteResult {
            reply,
            details,
            undo,
            append: true,
        }
    }

    pub fn no_append(mut self) -> WriteResult {
        self.append = false;
        self
    }
}

/// Apply one write command to the in-memory state. The caller holds the
/// write lock and handles log append, hook delivery, and fan-out.
pub fn apply_write(db: &mut Db, msg: &Message, start: Instant) -> Result<WriteResult> {
    match msg.command().as_str() {
        "set" => crud::cmd_set(db, msg, start),
        "fset" => crud::cmd_fset(db, msg, start),
        "del" => crud::cmd_del(db, msg, start),
        "drop" => crud::cmd_drop(db, msg, start),
        "flushdb" => crud::cmd_flushdb(db, msg, start),
        "expire" => crud::cmd_expire(db, msg, start),
        "persist" => crud::cmd_persist(db, msg, start),
        "sethook" => hooks::cmd_sethook(db, msg, start),
        "delhook" => hooks::cmd_delhook(db, msg, start),
        other => Err(ServerError::UnknownCommand(other.to_string())),
    }
}

/// Go-style elapsed rendering for the reply envelope.
pub fn elapsed(start: Instant) -> String {
    format!("{:?}", start.elapsed())
}
