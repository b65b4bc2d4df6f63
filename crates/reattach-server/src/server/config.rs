use crate::server::{orchestrator::OrchestratorConfig, serve::ListenerKind, shutdown::StopMode};
use anyhow::bail;
use clap::{Parser, Subcommand};
use core::time::Duration;
use reattach_core::types::DEFAULT_NAMESPACE;

/// Runtime configuration for the `plugintest` binary.
///
/// All values are parsed from CLI arguments or environment variables. A `.env`
/// file in the working directory is loaded first.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "plugintest",
    version,
    about = "Run a gRPC plugin in-process and let an external host reattach to it"
)]
pub struct CliArgs {
    /// Full plugin name, e.g. `terraform-provider-foo`.
    ///
    /// The `terraform-provider-` prefix is stripped to build the registry key
    /// the host looks the plugin up under.
    ///
    /// Environment variable: `PLUGIN_NAME`
    #[arg(long, env = "PLUGIN_NAME", default_value_t = String::from("terraform-provider-plugintest"))]
    pub plugin_name: String,

    /// Registry namespace the host assumes for short provider names.
    ///
    /// Environment variable: `PLUGIN_NAMESPACE`
    #[arg(long, env = "PLUGIN_NAMESPACE", default_value_t = String::from(DEFAULT_NAMESPACE))]
    pub namespace: String,

    /// How long to wait for a plugin server to report its address, in
    /// milliseconds.
    ///
    /// Environment variable: `PLUGIN_HANDSHAKE_TIMEOUT_MS`
    #[arg(long, env = "PLUGIN_HANDSHAKE_TIMEOUT_MS", default_value_t = 2000)]
    pub handshake_timeout_ms: u64,

    /// Listen on a Unix socket instead of loopback TCP.
    #[arg(short, long, default_value_t = false)]
    pub uds: bool,

    /// Ask launched plugins to stop gracefully before killing them. Also
    /// enabled by the presence of `TF_PROVIDER_SOFT_STOP`.
    #[arg(long, default_value_t = false)]
    pub soft_stop: bool,

    /// Emit logs as JSON lines.
    ///
    /// Environment variable: `LOG_JSON`
    #[arg(long, env = "LOG_JSON", default_value_t = false)]
    pub log_json: bool,

    #[command(subcommand)]
    pub mode: Mode,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// Serve the plugin in-process and run `command` against it once.
    Run {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Serve the plugin as a subprocess of a plugin host.
    Serve,
    /// Launch `command` as a plugin subprocess, print its reattach value and
    /// keep it alive until Ctrl+C.
    Launch {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
}

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub plugin_name: String,
    pub namespace: String,
    pub handshake_timeout: Duration,
    pub uds: bool,
    pub soft_stop: bool,
    pub log_json: bool,
    pub mode: Mode,
}

impl HarnessConfig {
    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            namespace: self.namespace.clone(),
            handshake_timeout: self.handshake_timeout,
        }
    }

    pub const fn listener(&self) -> ListenerKind {
        if self.uds {
            ListenerKind::Unix
        } else {
            ListenerKind::Tcp
        }
    }

    /// The flag wins; otherwise the process environment decides.
    pub fn stop_mode(&self) -> StopMode {
        if self.soft_stop {
            StopMode::GracefulPreferred
        } else {
            StopMode::from_env()
        }
    }
}

impl TryFrom<CliArgs> for HarnessConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.plugin_name.trim().is_empty() {
            bail!("PLUGIN_NAME must not be empty");
        }

        if args.namespace.trim().is_empty() {
            bail!("PLUGIN_NAMESPACE must not be empty");
        }

        if args.handshake_timeout_ms == 0 {
            bail!("PLUGIN_HANDSHAKE_TIMEOUT_MS must be greater than 0");
        }

        if args.uds && !cfg!(unix) {
            bail!("Unix domain sockets are not supported on this platform");
        }

        Ok(Self {
            plugin_name: args.plugin_name,
            namespace: args.namespace,
            handshake_timeout: Duration::from_millis(args.handshake_timeout_ms),
            uds: args.uds,
            soft_stop: args.soft_stop,
            log_json: args.log_json,
            mode: args.mode,
        })
    }
}
