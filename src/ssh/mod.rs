//! SSH module - the jump host connection
//!
//! # Features
//! - Public key authentication with a pre-resolved credential
//! - Host key verification via ~/.ssh/known_hosts (trust on first use)
//! - direct-tcpip channels serialized through a single handle-owner task
//! - Non-blocking liveness reporting

mod client;
mod config;
mod error;
mod handle_owner;
pub mod known_hosts;
mod transport;

pub use client::ClientHandler;
pub use config::{JumpTarget, TransportOptions};
pub use error::SshError;
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use known_hosts::{HostKeyVerification, KnownHosts};
pub use transport::{
    BoxedStream, ChannelOpener, ForwardStream, SshTransport, SshTransportFactory, Transport,
    TransportFactory, TransportState,
};
