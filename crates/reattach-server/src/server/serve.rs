//! gRPC serve loops for plugins.
//!
//! Two entry points share one listener/serve path:
//!
//! - [`serve_test`] runs inside the test process. It reports its address on a
//!   handshake channel, serves until its [`CancellationToken`] fires and then
//!   completes its [`CompletionSignal`].
//! - [`serve_plugin`] runs as a subprocess launched by a plugin host. It checks
//!   the magic cookie, prints the handshake line on stdout and serves until
//!   Ctrl+C or SIGTERM.
//!
//! Both also serve the standard gRPC health service, reporting
//! [`PLUGIN_HEALTH_SERVICE`] as SERVING until shutdown begins.

use crate::server::{shutdown::EmbeddedServer, transport::GrpcPlugin};
use core::{future::Future, net::Ipv4Addr, time::Duration};
use reattach_core::{
    BoxError, ConnectionDescriptor, Error, Network, Result,
    channel::{self, Completion, CompletionSignal, HandshakeSender},
    types::{MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PLUGIN_HEALTH_SERVICE},
};
use std::io::Write;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpListener,
    signal,
    sync::Mutex,
};
use tokio_stream::{Stream, wrappers::TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Server, server::Connected};
use tonic_health::ServingStatus;
use tracing::{debug, error, info, warn};

/// Which kind of socket a plugin server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    /// An ephemeral port on the loopback interface.
    Tcp,
    /// A socket file in a fresh temporary directory.
    Unix,
}

impl Default for ListenerKind {
    fn default() -> Self {
        if cfg!(unix) { Self::Unix } else { Self::Tcp }
    }
}

/// Everything a test-mode serve loop needs from its orchestrator.
#[derive(Debug)]
pub struct ServeTestConfig {
    /// Cancelled by the orchestrator once the server should stop.
    pub cancel: CancellationToken,
    /// Receives the server's descriptor once it is listening.
    pub handshake: HandshakeSender,
    /// Completed (or dropped) once the server has fully stopped.
    pub done: CompletionSignal,
}

/// Serves `plugin` inside the current process until `config.cancel` fires.
///
/// Never returns an error: failures are logged, and the handshake sender is
/// dropped unused if the server could not start, which the waiting side
/// observes as [`Error::HandshakeAborted`]. `config.done` is completed on every
/// path.
pub async fn serve_test<P: GrpcPlugin>(plugin: P, listener: ListenerKind, config: ServeTestConfig) {
    let ServeTestConfig {
        cancel,
        handshake,
        done,
    } = config;

    let announce = move |descriptor: ConnectionDescriptor| -> Result<()> {
        debug!(
            network = %descriptor.network,
            address = %descriptor.address,
            "plugin server listening"
        );
        if !handshake.send(Some(descriptor)) {
            warn!("nobody is waiting for the reattach config");
        }
        Ok(())
    };

    if let Err(e) = serve_on(&plugin, listener, true, announce, cancel.cancelled()).await {
        error!(error = %e, "plugin server failed");
    }

    done.complete();
}

/// Serves `plugin` as a subprocess of a plugin host.
///
/// # Errors
///
/// - [`Error::MagicCookie`] if the process was not launched by a host.
/// - [`Error::Io`] / [`Error::Transport`] if binding or serving fails.
pub async fn serve_plugin<P: GrpcPlugin>(plugin: P, listener: ListenerKind) -> Result<()> {
    if std::env::var(MAGIC_COOKIE_KEY).ok().as_deref() != Some(MAGIC_COOKIE_VALUE) {
        return Err(Error::MagicCookie);
    }

    let announce = |descriptor: ConnectionDescriptor| -> Result<()> {
        info!(
            network = %descriptor.network,
            address = %descriptor.address,
            "plugin server listening"
        );
        // The host reads exactly one line from our stdout.
        let mut stdout = std::io::stdout().lock();
        writeln!(stdout, "{}", descriptor.handshake_line())?;
        stdout.flush()?;
        Ok(())
    };

    serve_on(&plugin, listener, false, announce, shutdown_signal()).await
}

async fn serve_on<P, A, F>(
    plugin: &P,
    listener: ListenerKind,
    test: bool,
    announce: A,
    shutdown: F,
) -> Result<()>
where
    P: GrpcPlugin,
    A: FnOnce(ConnectionDescriptor) -> Result<()>,
    F: Future<Output = ()>,
{
    match listener {
        ListenerKind::Tcp => {
            let tcp = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
            let addr = tcp.local_addr()?;
            announce(ConnectionDescriptor::local(
                Network::Tcp,
                addr.to_string(),
                test,
            ))?;
            run_server_with_incoming(plugin, TcpListenerStream::new(tcp), shutdown).await
        }
        #[cfg(unix)]
        ListenerKind::Unix => {
            use tokio::net::UnixListener;
            use tokio_stream::wrappers::UnixListenerStream;

            // Dropping `dir` removes the socket along with it.
            let dir = tempfile::Builder::new().prefix("plugin").tempdir()?;
            let path = dir.path().join("plugin.sock");
            let uds = UnixListener::bind(&path)?;
            announce(ConnectionDescriptor::local(
                Network::Unix,
                path.display().to_string(),
                test,
            ))?;
            run_server_with_incoming(plugin, UnixListenerStream::new(uds), shutdown).await
        }
        #[cfg(not(unix))]
        ListenerKind::Unix => Err(Error::UnsupportedNetwork(Network::Unix.to_string())),
    }
}

async fn run_server_with_incoming<P, I, IO, IE, F>(
    plugin: &P,
    incoming: I,
    shutdown: F,
) -> Result<()>
where
    P: GrpcPlugin,
    I: Stream<Item = core::result::Result<IO, IE>>,
    IO: AsyncRead + AsyncWrite + Connected + Unpin + Send + 'static,
    IE: Into<BoxError>,
    F: Future<Output = ()>,
{
    let (health_reporter, health_service) = tonic_health::server::health_reporter();
    health_reporter
        .set_service_status(PLUGIN_HEALTH_SERVICE, ServingStatus::Serving)
        .await;

    plugin
        .register(&mut Server::builder())
        .add_service(health_service)
        .serve_with_incoming_shutdown(incoming, async {
            shutdown.await;
            debug!("plugin server shutting down");
            health_reporter
                .set_service_status(PLUGIN_HEALTH_SERVICE, ServingStatus::NotServing)
                .await;
        })
        .await?;

    debug!("plugin server stopped");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

/// A test-mode server owned directly by a [`ServiceHandle`], outside of any
/// orchestrated session.
///
/// [`ServiceHandle`]: crate::server::shutdown::ServiceHandle
#[derive(Debug)]
pub struct InProcessServer {
    descriptor: ConnectionDescriptor,
    cancel: CancellationToken,
    completion: Mutex<Option<Completion>>,
}

impl InProcessServer {
    /// Spawns [`serve_test`] and waits at most `limit` for it to listen.
    ///
    /// # Errors
    ///
    /// Any handshake error from [`Handshake::wait`]; the server is cancelled
    /// before returning it.
    ///
    /// [`Handshake::wait`]: reattach_core::channel::Handshake::wait
    pub async fn start<P: GrpcPlugin>(
        plugin: P,
        listener: ListenerKind,
        limit: Duration,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let (handshake_tx, handshake) = channel::handshake();
        let (done, completion) = channel::completion();

        tokio::spawn(serve_test(
            plugin,
            listener,
            ServeTestConfig {
                cancel: cancel.clone(),
                handshake: handshake_tx,
                done,
            },
        ));

        match handshake.wait(limit).await {
            Ok(descriptor) => Ok(Self {
                descriptor,
                cancel,
                completion: Mutex::new(Some(completion)),
            }),
            Err(e) => {
                cancel.cancel();
                Err(e)
            }
        }
    }

    pub const fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }
}

#[tonic::async_trait]
impl EmbeddedServer for InProcessServer {
    /// Concurrent callers queue on the lock, so every caller returns only
    /// once the server has stopped.
    async fn stop(&self) {
        self.cancel.cancel();
        let mut completion = self.completion.lock().await;
        if let Some(completion) = completion.take() {
            completion.wait().await;
        }
    }
}

impl Drop for InProcessServer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::provider::reflection_plugin;
    use reattach_core::types::GRPC_PROTOCOL;
    use tonic_health::pb::{
        HealthCheckRequest, health_check_response::ServingStatus as Status,
        health_client::HealthClient,
    };

    const LIMIT: Duration = Duration::from_secs(2);

    async fn health_status(descriptor: &ConnectionDescriptor) -> i32 {
        let channel = descriptor.connect().await.unwrap();
        HealthClient::new(channel)
            .check(HealthCheckRequest {
                service: PLUGIN_HEALTH_SERVICE.to_string(),
            })
            .await
            .unwrap()
            .into_inner()
            .status
    }

    #[tokio::test]
    async fn serve_test_reports_descriptor_and_completes() {
        let cancel = CancellationToken::new();
        let (handshake_tx, handshake) = channel::handshake();
        let (done, completion) = channel::completion();

        tokio::spawn(serve_test(
            reflection_plugin().unwrap(),
            ListenerKind::Tcp,
            ServeTestConfig {
                cancel: cancel.clone(),
                handshake: handshake_tx,
                done,
            },
        ));

        let descriptor = handshake.wait(LIMIT).await.unwrap();
        assert_eq!(descriptor.protocol, GRPC_PROTOCOL);
        assert_eq!(descriptor.network, Network::Tcp);
        assert_eq!(descriptor.pid, std::process::id());
        assert!(descriptor.test);
        assert_eq!(health_status(&descriptor).await, Status::Serving as i32);

        cancel.cancel();
        completion.wait().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unix_socket_is_removed_after_shutdown() {
        let server = InProcessServer::start(reflection_plugin().unwrap(), ListenerKind::Unix, LIMIT)
            .await
            .unwrap();
        let descriptor = server.descriptor().clone();
        assert_eq!(descriptor.network, Network::Unix);
        assert!(std::path::Path::new(&descriptor.address).exists());
        assert_eq!(health_status(&descriptor).await, Status::Serving as i32);

        server.stop().await;
        assert!(!std::path::Path::new(&descriptor.address).exists());
    }

    #[tokio::test]
    async fn stopping_twice_is_harmless_for_in_process_server() {
        let server = InProcessServer::start(reflection_plugin().unwrap(), ListenerKind::Tcp, LIMIT)
            .await
            .unwrap();

        server.stop().await;
        server.stop().await;
        assert!(server.descriptor().connect().await.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn concurrent_stops_both_wait_for_shutdown() {
        let server = InProcessServer::start(reflection_plugin().unwrap(), ListenerKind::Unix, LIMIT)
            .await
            .unwrap();
        let socket = std::path::PathBuf::from(&server.descriptor().address);

        let first = async {
            server.stop().await;
            socket.exists()
        };
        let second = async {
            server.stop().await;
            socket.exists()
        };
        let (first_sees_socket, second_sees_socket) = tokio::join!(first, second);

        assert!(!first_sees_socket);
        assert!(!second_sees_socket);
    }

    #[tokio::test]
    async fn serve_plugin_requires_magic_cookie() {
        assert!(std::env::var_os(MAGIC_COOKIE_KEY).is_none());

        let result = serve_plugin(reflection_plugin().unwrap(), ListenerKind::Tcp).await;
        assert!(matches!(result, Err(Error::MagicCookie)));
    }
}
