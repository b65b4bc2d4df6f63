//! Closing a consumer's handle on a plugin.
//!
//! A [`ServiceHandle`] may own an in-process server, a client for a real
//! subprocess plugin, or both. [`ShutdownController::close`] tears it down in a
//! fixed order:
//!
//! 1. Stop the embedded server, if any. This happens on every path.
//! 2. Without a plugin client there is nothing left to do.
//! 3. With [`StopMode::GracefulPreferred`], try to obtain a live client
//!    connection and close it gracefully, returning that result verbatim. If no
//!    connection can be obtained, fall through to step 4.
//! 4. Kill the plugin. Killing always reports success.
//!
//! `close` consumes the handle, so a handle can only ever be closed once.

use reattach_core::{Result, types::SOFT_STOP_ENV};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// How a plugin client should be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopMode {
    /// Ask the plugin to shut down on its own; kill it only if it cannot be
    /// reached.
    GracefulPreferred,
    /// Always kill the plugin.
    #[default]
    AlwaysHard,
}

impl StopMode {
    /// [`StopMode::GracefulPreferred`] if [`SOFT_STOP_ENV`] is present in the
    /// process environment, whatever its value.
    pub fn from_env() -> Self {
        if std::env::var_os(SOFT_STOP_ENV).is_some() {
            Self::GracefulPreferred
        } else {
            Self::AlwaysHard
        }
    }
}

/// A plugin server running inside the current process.
#[tonic::async_trait]
pub trait EmbeddedServer: Send + Sync {
    /// Stops the server and waits for it to finish.
    async fn stop(&self);
}

/// Client side of a plugin running as a separate process.
#[tonic::async_trait]
pub trait PluginClient: Send + Sync {
    /// Obtains a live protocol connection to the plugin.
    async fn client(&self) -> Result<Box<dyn ClientProtocol>>;

    /// Forcibly terminates the plugin. Failures are the implementor's to log.
    async fn kill(&self);
}

/// A live protocol connection to a plugin.
#[tonic::async_trait]
pub trait ClientProtocol: Send {
    /// Closes the connection, asking the plugin to stop gracefully.
    async fn close(self: Box<Self>) -> Result<()>;
}

/// What a consumer holds on to for one plugin.
#[derive(Default)]
pub struct ServiceHandle {
    embedded_server: Option<Box<dyn EmbeddedServer>>,
    plugin_client: Option<Arc<dyn PluginClient>>,
}

impl ServiceHandle {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_embedded_server(mut self, server: impl EmbeddedServer + 'static) -> Self {
        self.embedded_server = Some(Box::new(server));
        self
    }

    /// Attaches a plugin client. The client may be shared with other
    /// subsystems, but only this handle closes it.
    #[must_use]
    pub fn with_plugin_client(mut self, client: Arc<dyn PluginClient>) -> Self {
        self.plugin_client = Some(client);
        self
    }

    /// Closes the handle with `controller`.
    ///
    /// # Errors
    ///
    /// See [`ShutdownController::close`].
    pub async fn close(self, controller: &ShutdownController) -> Result<()> {
        controller.close(self).await
    }
}

/// Decides between a graceful stop and a kill when a handle is closed.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownController {
    mode: StopMode,
}

impl ShutdownController {
    pub const fn new(mode: StopMode) -> Self {
        Self { mode }
    }

    pub const fn mode(&self) -> StopMode {
        self.mode
    }

    /// Closes `handle`.
    ///
    /// # Errors
    ///
    /// Only the graceful close path can fail; its error is returned unchanged.
    pub async fn close(&self, handle: ServiceHandle) -> Result<()> {
        trace!(mode = ?self.mode, "closing service handle");

        if let Some(server) = handle.embedded_server {
            server.stop().await;
        }

        let Some(client) = handle.plugin_client else {
            debug!("service handle has no plugin client");
            return Ok(());
        };

        if self.mode == StopMode::GracefulPreferred {
            debug!("soft stop requested");
            match client.client().await {
                Ok(protocol) => {
                    debug!("calling graceful close instead of kill on plugin");
                    return protocol.close().await;
                }
                Err(e) => {
                    error!(error = %e, "can't obtain client for plugin, killing process instead");
                }
            }
        }

        client.kill().await;
        Ok(())
    }
}
