//! Recon protocol surface.
//!
//! Newline-delimited JSON over a Unix stream socket. The `Server` exposes a
//! daemon's store, controller status and adapter bridge; the `Client` speaks
//! the same protocol and implements `State`; `run_remote_controller` hosts a
//! controller in another process.

#![forbid(unsafe_code)]

pub mod client;
pub mod protocol;
pub mod remote;
pub mod server;

pub use client::{Client, TaskStream};
pub use protocol::{ClientFrame, ProtocolError, Request, Response, ServerFrame};
pub use remote::run_remote_controller;
pub use server::Server;

/// Socket path used when neither `--socket-path` nor `RECON_SOCKET_PATH`
/// is given.
pub const DEFAULT_SOCKET_PATH: &str = "/var/run/recon.sock";
