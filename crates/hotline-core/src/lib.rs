//! # Hotline protocol core
//!
//! A server and client implementation of the Hotline wire protocol: a
//! stateful, length-framed binary transaction protocol for community
//! chat, file transfer and news on small private servers.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        hotline-server / hotline-client      │
//! ├──────────────────────┬──────────────────────┤
//! │    server (engine)   │   client (engine)    │
//! ├──────────┬───────────┴───────┬──────────────┤
//! │  account │  files  │  news   │   transfer   │
//! ├──────────┴─────────┴─────────┴──────────────┤
//! │            protocol (codec + framer)        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The protocol layer is pure: transactions are parsed from and encoded
//! to byte buffers with no I/O. The server engine runs one reader and
//! one writer task per connection; all shared state sits behind a single
//! coarse mutex. File transfers run on a separate listener keyed by
//! one-shot reference numbers.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]

pub mod access;
pub mod account;
pub mod client;
pub mod error;
pub mod files;
pub mod logging;
pub mod news;
pub mod protocol;
pub mod rng;
pub mod server;
pub mod transfer;
pub mod user;

pub use error::{Error, Result};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version carried in the handshake.
pub const PROTOCOL_VERSION: u16 = 1;

/// Largest field payload accepted by the codec (2 MiB).
pub const MAX_FIELD_SIZE: usize = 2 * 1024 * 1024;

/// Largest transaction payload accepted by the framer (derived from the
/// field cap plus headroom for the field list itself).
pub const MAX_TRANSACTION_SIZE: usize = MAX_FIELD_SIZE + 4096;

/// Default cap on the flat news board (64 KiB); the tail is truncated.
pub const DEFAULT_FLAT_NEWS_LIMIT: usize = 64 * 1024;

/// Default number of concurrent file transfers allowed per user.
pub const DEFAULT_TRANSFER_CAP: usize = 3;

/// Seconds of silence after which a transfer connection is aborted.
pub const TRANSFER_IDLE_SECS: u64 = 30;

/// Deadline for both handshakes (main port and transfer port).
pub const HANDSHAKE_DEADLINE_SECS: u64 = 5;

/// Interval between client keep-alive transactions.
pub const KEEPALIVE_INTERVAL_SECS: u64 = 300;
