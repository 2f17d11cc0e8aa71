//! Meridian: an in-memory geospatial database server.
//!
//! Keyed collections of identified geometric objects answer spatial
//! queries (point-radius, bounding box, polygon containment,
//! intersection) over a line-oriented request/reply protocol. Every
//! mutating command lands in an append-only log that is replayed at
//! startup, compacted online, and streamed to followers; geofence
//! subscriptions turn spatial predicates into push streams of
//! enter/exit/cross/inside/outside events.
//!
//! Crate layout mirrors the moving parts:
//!
//! - [`protocol`] / [`args`]: wire framing and argument grammar
//! - [`engine`]: dispatch, locking discipline, reply envelopes
//! - [`db`] / [`expire`]: the shared in-memory state
//! - [`aof`] / [`shrink`]: the durability log and its online rewrite
//! - [`follow`] / [`client`]: leader/follower replication
//! - [`hook`] / [`fence`] / [`dispatch`] / [`endpoint`]: geofences and
//!   event delivery
//! - [`server`]: assembly and the TCP front end

pub mod aof;
pub mod args;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod endpoint;
pub mod engine;
pub mod error;
pub mod expire;
pub mod fence;
pub mod follow;
pub mod glob;
pub mod hook;
pub mod protocol;
pub mod scan_writer;
pub mod server;
pub mod shrink;

pub use config::ServerOptions;
pub use error::{Result, ServerError};
pub use server::Server;
