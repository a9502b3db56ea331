//! # ssd-ipc
//!
//! Unix-socket plumbing shared by the supervisor daemon and its clients:
//! well-known paths, request/reply framing, a streaming connection server
//! with an idle timeout, a blocking client, and daemon lifecycle helpers.

pub mod client;
pub mod daemon;
pub mod frame;
pub mod paths;
pub mod server;

#[cfg(feature = "clap")]
pub mod clap;

pub use client::{ClientError, DaemonClient};
pub use daemon::{Daemon, DaemonError};
pub use paths::DaemonPaths;
pub use server::{Flow, Responder, ServeError, ServerOptions};
