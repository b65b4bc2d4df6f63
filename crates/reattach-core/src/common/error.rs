//! Error types for the plugin reattach harness.
//!
//! This module defines the central `Error` enum shared by the orchestrator,
//! the serve loops and the shutdown controller.
//!
//! ## Error Cases
//! - `Timeout`: No connection descriptor arrived within the handshake bound.
//! - `InvalidDescriptor`: The server reported readiness without a descriptor.
//! - `HandshakeAborted`: The server went away before reporting anything.
//! - `Serialization`: The reattach value could not be encoded or decoded.
//! - `Command`: The external command failed. Teardown still ran.
//! - `UnsupportedTransport`: A legacy (non-gRPC) transport was requested.
//! - `InvalidHandshake`: A subprocess printed a malformed handshake line.
//! - `UnsupportedNetwork`: A descriptor named a network other than unix/tcp.
//! - `MagicCookie`: A subprocess plugin was started outside of a host.
//! - `Transport`, `Status`, `Io`: Failures bubbling up from tonic or the OS.

use core::time::Duration;

pub type Result<T> = core::result::Result<T, Error>;

/// Boxed error returned by external command callbacks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Unified error type for the plugin reattach harness.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The server did not deliver its connection descriptor in time.
    #[error("Timeout after {after:?} waiting on reattach config")]
    Timeout { after: Duration },

    /// The server signalled readiness but delivered no descriptor.
    #[error("Nil reattach config received")]
    InvalidDescriptor,

    /// The server dropped its handshake sender without delivering anything.
    #[error("Plugin server exited before reporting its address")]
    HandshakeAborted,

    /// The reattach value could not be encoded or decoded.
    #[error("Serialization error: {reason}")]
    Serialization { reason: String },

    /// The external command returned an error.
    #[error("Command failed: {0}")]
    Command(#[source] BoxError),

    /// A legacy, non-gRPC transport was requested.
    #[error("Only gRPC service exposure is implemented")]
    UnsupportedTransport,

    /// A subprocess plugin printed a handshake line we cannot use.
    #[error("Invalid handshake line {line:?}: {reason}")]
    InvalidHandshake { line: String, reason: String },

    /// A descriptor named an unknown transport family.
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(String),

    /// The plugin binary was started directly rather than by a plugin host.
    #[error(
        "This binary is a plugin. These are not meant to be executed directly. \
         Please execute the program that consumes these plugins, which will \
         load any plugins automatically"
    )]
    MagicCookie,

    /// gRPC transport failure (bind, dial).
    #[error("Transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    /// A gRPC call returned a non-OK status.
    #[error("gRPC status: {0}")]
    Status(Box<tonic::Status>),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Self::Status(Box::new(status))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            reason: err.to_string(),
        }
    }
}
