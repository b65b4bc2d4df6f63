//! # Plugin reattach harness
//!
//! - [`orchestrator`] runs one external command against an in-process plugin
//!   server and publishes the server's address through a [`env::WorkingDir`].
//! - [`serve`] holds the gRPC serve loops, for in-process tests and for real
//!   plugin subprocesses.
//! - [`transport`] is the seam between a plugin implementation and the gRPC
//!   server.
//! - [`shutdown`] closes a handle on a plugin, gracefully or by force.
//! - [`process`] launches a plugin subprocess the way a host does.
//! - [`config`] and [`telemetry`] back the `plugintest` binary.

pub mod config;
pub mod env;
pub mod orchestrator;
pub mod process;
pub mod provider;
pub mod serve;
pub mod shutdown;
pub mod telemetry;
pub mod transport;
