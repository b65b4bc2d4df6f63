//! # Protocol Constants
//!
//! Well-known names and values shared by the plugin host (the external
//! orchestrator), the in-process harness and subprocess plugins. Both sides of
//! a session must agree on every value here, so they are fixed at compile time.
//!
//! ## Environment variables
//!
//! - [`REATTACH_PROVIDERS_ENV`] - JSON map of registry key to reattach config
//! - [`PROTOCOL_VERSIONS_ENV`] - App protocol versions the host may negotiate
//! - [`SOFT_STOP_ENV`] - Presence selects a graceful plugin stop over a kill
//! - [`MAGIC_COOKIE_KEY`] - Proves a subprocess plugin was launched by a host

use core::time::Duration;

/// Environment variable carrying the reattach map to the external command.
pub const REATTACH_PROVIDERS_ENV: &str = "TF_REATTACH_PROVIDERS";

/// Environment variable declaring the app protocol version. Needed because
/// the host skips its own handshake when it did not launch the plugin.
pub const PROTOCOL_VERSIONS_ENV: &str = "PLUGIN_PROTOCOL_VERSIONS";

/// Environment variable whose presence (not value) requests a soft stop.
pub const SOFT_STOP_ENV: &str = "TF_PROVIDER_SOFT_STOP";

/// Magic cookie key checked by subprocess plugins before serving.
pub const MAGIC_COOKIE_KEY: &str = "TF_PLUGIN_MAGIC_COOKIE";

/// Magic cookie value checked by subprocess plugins before serving.
pub const MAGIC_COOKIE_VALUE: &str =
    "d602bf8f470bc67ca7faa0386276bbdd4330efaf76d1a219cb4d6991ca9872b2";

/// Version of the handshake line format itself.
pub const CORE_PROTOCOL_VERSION: u32 = 1;

/// App protocol version spoken by every plugin served from this workspace.
pub const PROTOCOL_VERSION: u32 = 5;

/// Wire protocol identifier written into every descriptor.
pub const GRPC_PROTOCOL: &str = "grpc";

/// Prefix stripped from plugin names to obtain the short provider name.
pub const PROVIDER_PREFIX: &str = "terraform-provider-";

/// Namespace assumed by the host for providers given only by short name.
pub const DEFAULT_NAMESPACE: &str = "hashicorp";

/// Upper bound on the wait for a server's connection descriptor.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

/// Service name reported as SERVING by the plugin health service.
pub const PLUGIN_HEALTH_SERVICE: &str = "plugin";
