//! Running one external command against an in-process plugin server.
//!
//! [`run_provider_command`] starts a plugin server in the background, learns
//! its address, publishes that address to the external command's environment,
//! runs the command once and then tears the server down. The host started by
//! the command reattaches to our server instead of launching the plugin
//! itself, so the plugin code runs under the test process's debugger and
//! coverage instrumentation.
//!
//! ## Ordering
//!
//! - The reattach variable is set strictly before the command runs.
//! - The server is cancelled strictly after the command returns.
//! - The reattach variable is removed strictly after the server confirmed it
//!   stopped, whether or not the command succeeded.
//!
//! ## Failure modes
//!
//! - No descriptor within the handshake bound, an empty descriptor, or a
//!   server that dies before reporting: the call fails before the environment
//!   is touched and before the command runs.
//! - The descriptor cannot be serialized: the server is still cancelled and
//!   awaited, and nothing is published. With today's wire types (strings,
//!   integers and booleans) encoding cannot fail, so this path is defensive.
//! - The command fails: its error is logged and returned after full teardown.
//!
//! The wait for the server to stop has no timeout. A server that ignores
//! cancellation hangs the call.

use crate::server::{
    env::WorkingDir,
    serve::{ListenerKind, ServeTestConfig, serve_test},
    transport::GrpcPlugin,
};
use core::{future::Future, time::Duration};
use reattach_core::{
    BoxError, Error, ReattachProviders, Result,
    channel::{self, Completion},
    registry_key,
    types::{
        DEFAULT_NAMESPACE, HANDSHAKE_TIMEOUT, PROTOCOL_VERSION, PROTOCOL_VERSIONS_ENV,
        REATTACH_PROVIDERS_ENV,
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, debug, info_span, warn};

/// Knobs of an orchestrated session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Namespace the host assumes for short provider names.
    pub namespace: String,
    /// How long to wait for the server's descriptor.
    pub handshake_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }
}

/// Runs `command` once while the server launched by `start` is reachable
/// through the reattach variable in `wd`.
///
/// `start` receives the session's [`ServeTestConfig`] and returns the serve
/// loop, which is spawned as the session's only background task. It must
/// deliver exactly one descriptor on the handshake and drop or complete the
/// completion signal once it has stopped.
///
/// # Errors
///
/// - [`Error::Timeout`], [`Error::InvalidDescriptor`],
///   [`Error::HandshakeAborted`]: the server never became reachable; the
///   command did not run.
/// - [`Error::Serialization`]: the descriptor could not be published; the
///   command did not run.
/// - [`Error::Command`]: the command failed; teardown completed.
pub async fn run_provider_command<W, S, SF, C, CF, E>(
    config: &OrchestratorConfig,
    wd: &W,
    start: S,
    command: C,
) -> Result<()>
where
    W: WorkingDir + ?Sized,
    S: FnOnce(ServeTestConfig) -> SF,
    SF: Future<Output = ()> + Send + 'static,
    C: FnOnce() -> CF,
    CF: Future<Output = core::result::Result<(), E>>,
    E: Into<BoxError>,
{
    let key = registry_key(wd.plugin_name(), &config.namespace);
    let span = info_span!("plugintest", provider = %key);

    async move {
        let cancel = CancellationToken::new();
        // Cancels the server on every early return below.
        let _guard = cancel.clone().drop_guard();

        let (handshake_tx, handshake) = channel::handshake();
        let (done, completion) = channel::completion();
        tokio::spawn(
            start(ServeTestConfig {
                cancel: cancel.clone(),
                handshake: handshake_tx,
                done,
            })
            .instrument(Span::current()),
        );

        let descriptor = handshake.wait(config.handshake_timeout).await?;
        debug!(
            network = %descriptor.network,
            address = %descriptor.address,
            "received reattach config"
        );

        let reattach = match ReattachProviders::single(key.as_str(), &descriptor).to_env_value() {
            Ok(value) => value,
            Err(e) => {
                stop_server(&cancel, completion).await;
                return Err(e);
            }
        };

        // The host did not launch the plugin, so it skips the handshake and
        // would otherwise assume an older protocol version.
        wd.setenv(PROTOCOL_VERSIONS_ENV, &PROTOCOL_VERSION.to_string());
        wd.setenv(REATTACH_PROVIDERS_ENV, &reattach);

        let result = command().await.map_err(|e| Error::Command(e.into()));
        if let Err(e) = &result {
            warn!(error = %e, "got error running command");
        }

        stop_server(&cancel, completion).await;

        // The server behind this address no longer exists.
        wd.unsetenv(REATTACH_PROVIDERS_ENV);

        result
    }
    .instrument(span)
    .await
}

/// [`run_provider_command`] serving `plugin` with [`serve_test`].
///
/// # Errors
///
/// See [`run_provider_command`].
pub async fn run_plugin_command<W, P, C, CF, E>(
    config: &OrchestratorConfig,
    wd: &W,
    plugin: P,
    listener: ListenerKind,
    command: C,
) -> Result<()>
where
    W: WorkingDir + ?Sized,
    P: GrpcPlugin,
    C: FnOnce() -> CF,
    CF: Future<Output = core::result::Result<(), E>>,
    E: Into<BoxError>,
{
    run_provider_command(
        config,
        wd,
        move |serve| serve_test(plugin, listener, serve),
        command,
    )
    .await
}

async fn stop_server(cancel: &CancellationToken, completion: Completion) {
    cancel.cancel();
    completion.wait().await;
    debug!("plugin server stopped");
}
