//! simpleperf - a minimal TCP throughput tester
//!
//! A client opens one or more TCP connections to a server and pushes
//! fixed-size chunks of zeros for a fixed time or until a byte target is
//! met. Both ends report the amount of data moved and the rate achieved.
//!
//! # Features
//!
//! - Time-bounded or byte-count-bounded transfers
//! - Optional per-interval rows that reconcile with the session total
//! - Parallel client connections, each measured independently
//! - Concurrent server sessions with a configurable cap
//! - Table or JSON output
//! - Asynchronous I/O using tokio
//!
//! # Wire format
//!
//! Each connection starts with a 43-byte control handshake made of three
//! fixed-width, NUL-padded ASCII fields: duration in seconds (8 bytes),
//! client start time in epoch seconds (32 bytes) and mode (3 bytes, `NUM`
//! for byte-count mode). The payload follows as 1000-byte chunks, ended by
//! `BYE`. The server answers `ACK: BYE`.

pub mod client;
pub mod config;
pub mod error;
pub mod interval_reporter;
pub mod measurements;
pub mod protocol;
pub mod server;
pub mod session;
pub mod transfer;

pub use client::{Client, ClientReport};
pub use config::{DisplayUnit, Role, StopCondition, TransferConfig};
pub use error::{Error, Result};
pub use measurements::{
    CollectingSink, NullSink, ReportSink, RowKind, SessionReport, TransferResult,
};
pub use protocol::{ControlHandshake, FramingError, TransferMode};
pub use server::Server;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
