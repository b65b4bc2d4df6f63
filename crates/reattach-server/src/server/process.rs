//! Client side of a plugin running as a separate process.
//!
//! [`PluginProcess::launch`] starts the plugin the way a plugin host does: it
//! sets the magic cookie, reads the handshake line from the child's stdout and
//! keeps the child around so [`ShutdownController`] can later close or kill it.
//!
//! [`ShutdownController`]: crate::server::shutdown::ShutdownController

use crate::server::shutdown::{ClientProtocol, PluginClient};
use core::time::Duration;
use reattach_core::{
    ConnectionDescriptor, Error, Result,
    types::{
        MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE, PLUGIN_HEALTH_SERVICE, PROTOCOL_VERSION,
        PROTOCOL_VERSIONS_ENV,
    },
};
use std::{process::Stdio, sync::Arc};
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStdout, Command},
    sync::Mutex,
};
use tonic::transport::Channel;
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};
use tracing::{debug, trace, warn};

/// How long a gracefully closed plugin gets to exit on its own.
pub const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(5);

/// How long dialing a plugin and checking its health may take together.
pub const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(2);

/// A plugin subprocess that completed its handshake.
#[derive(Debug)]
pub struct PluginProcess {
    child: Arc<Mutex<Child>>,
    pid: u32,
    descriptor: ConnectionDescriptor,
    stop_grace: Duration,
    client_timeout: Duration,
}

impl PluginProcess {
    /// Spawns `command` as a plugin and waits at most `limit` for its
    /// handshake line.
    ///
    /// The child is killed when the returned value is dropped, and on every
    /// error path below.
    ///
    /// # Errors
    ///
    /// - [`Error::Io`] if the process cannot be spawned or its stdout read.
    /// - [`Error::Timeout`] if no line arrived within `limit`.
    /// - [`Error::HandshakeAborted`] if the process closed stdout first.
    /// - [`Error::InvalidHandshake`] / [`Error::UnsupportedNetwork`] for a
    ///   line we cannot use.
    pub async fn launch(mut command: Command, limit: Duration) -> Result<Self> {
        command
            .env(MAGIC_COOKIE_KEY, MAGIC_COOKIE_VALUE)
            .env(PROTOCOL_VERSIONS_ENV, PROTOCOL_VERSION.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn()?;
        let (Some(pid), Some(stdout)) = (child.id(), child.stdout.take()) else {
            let _ = child.kill().await;
            return Err(Error::HandshakeAborted);
        };

        let mut lines = BufReader::new(stdout).lines();
        let descriptor = match read_handshake(&mut lines, pid, limit).await {
            Ok(descriptor) => descriptor,
            Err(e) => {
                if let Err(kill_err) = child.kill().await {
                    warn!(pid, error = %kill_err, "failed to kill plugin after bad handshake");
                }
                return Err(e);
            }
        };
        debug!(
            pid,
            network = %descriptor.network,
            address = %descriptor.address,
            "plugin process started"
        );

        // Anything printed after the handshake is forwarded to our logs, and
        // keeps the pipe from filling up.
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(pid, "plugin stdout: {line}");
            }
        });

        Ok(Self {
            child: Arc::new(Mutex::new(child)),
            pid,
            descriptor,
            stop_grace: DEFAULT_STOP_GRACE,
            client_timeout: DEFAULT_CLIENT_TIMEOUT,
        })
    }

    /// Overrides [`DEFAULT_STOP_GRACE`].
    #[must_use]
    pub const fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Overrides [`DEFAULT_CLIENT_TIMEOUT`].
    #[must_use]
    pub const fn with_client_timeout(mut self, limit: Duration) -> Self {
        self.client_timeout = limit;
        self
    }

    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub const fn descriptor(&self) -> &ConnectionDescriptor {
        &self.descriptor
    }

    /// Whether the process has exited, without waiting for it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the process state cannot be queried.
    pub async fn has_exited(&self) -> Result<bool> {
        Ok(self.child.lock().await.try_wait()?.is_some())
    }

    async fn healthy_channel(&self) -> Result<Channel> {
        let channel = self.descriptor.connect().await?;

        let status = HealthClient::new(channel.clone())
            .check(HealthCheckRequest {
                service: PLUGIN_HEALTH_SERVICE.to_string(),
            })
            .await?
            .into_inner()
            .status;
        if status != ServingStatus::Serving as i32 {
            return Err(tonic::Status::unavailable(format!(
                "plugin reported health status {status}"
            ))
            .into());
        }
        Ok(channel)
    }
}

async fn read_handshake(
    lines: &mut Lines<BufReader<ChildStdout>>,
    pid: u32,
    limit: Duration,
) -> Result<ConnectionDescriptor> {
    let line = tokio::time::timeout(limit, lines.next_line())
        .await
        .map_err(|_| Error::Timeout { after: limit })??
        .ok_or(Error::HandshakeAborted)?;
    trace!(pid, line = %line, "plugin handshake");
    ConnectionDescriptor::parse_handshake_line(&line, pid)
}

#[tonic::async_trait]
impl PluginClient for PluginProcess {
    async fn client(&self) -> Result<Box<dyn ClientProtocol>> {
        // A wedged plugin may accept connections and never answer.
        let channel = tokio::time::timeout(self.client_timeout, self.healthy_channel())
            .await
            .map_err(|_| Error::Timeout {
                after: self.client_timeout,
            })??;

        Ok(Box::new(GrpcClient {
            channel,
            child: Arc::clone(&self.child),
            pid: self.pid,
            stop_grace: self.stop_grace,
        }))
    }

    async fn kill(&self) {
        let mut child = self.child.lock().await;
        match child.kill().await {
            Ok(()) => debug!(pid = self.pid, "plugin process killed"),
            Err(e) => warn!(pid = self.pid, error = %e, "failed to kill plugin process"),
        }
    }
}

/// A live gRPC connection to a [`PluginProcess`].
#[derive(Debug)]
pub struct GrpcClient {
    channel: Channel,
    child: Arc<Mutex<Child>>,
    pid: u32,
    stop_grace: Duration,
}

impl GrpcClient {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

#[tonic::async_trait]
impl ClientProtocol for GrpcClient {
    async fn close(self: Box<Self>) -> Result<()> {
        let Self {
            channel,
            child,
            pid,
            stop_grace,
        } = *self;
        drop(channel);

        let mut child = child.lock().await;
        request_stop(&mut child, pid)?;

        let status = tokio::time::timeout(stop_grace, child.wait())
            .await
            .map_err(|_| Error::Timeout { after: stop_grace })??;
        debug!(pid, %status, "plugin process exited");
        Ok(())
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child, pid: u32) -> Result<()> {
    use nix::{
        sys::signal::{Signal, kill},
        unistd::Pid,
    };

    // Already reaped: nothing left to signal.
    if child.try_wait()?.is_some() {
        return Ok(());
    }
    let pid = i32::try_from(pid).map_err(|e| std::io::Error::other(e.to_string()))?;
    kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(std::io::Error::from)?;
    Ok(())
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child, pid: u32) -> Result<()> {
    trace!(pid, "no graceful stop on this platform, killing");
    child.start_kill()?;
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const LIMIT: Duration = Duration::from_secs(2);

    fn sh(script: &str) -> Command {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        command
    }

    #[tokio::test]
    async fn parses_handshake_and_passes_cookie() {
        let process = PluginProcess::launch(
            sh(r#"echo "1|5|unix|/tmp/$TF_PLUGIN_MAGIC_COOKIE-$PLUGIN_PROTOCOL_VERSIONS|grpc"; sleep 30"#),
            LIMIT,
        )
        .await
        .unwrap();

        let descriptor = process.descriptor();
        assert_eq!(descriptor.pid, process.pid());
        assert_eq!(
            descriptor.address,
            format!("/tmp/{MAGIC_COOKIE_VALUE}-{PROTOCOL_VERSION}")
        );
        assert!(!descriptor.test);
        assert!(!process.has_exited().await.unwrap());

        process.kill().await;
        assert!(process.has_exited().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_plugin_times_out() {
        let result = PluginProcess::launch(sh("sleep 30"), LIMIT).await;
        assert!(matches!(result, Err(Error::Timeout { .. })));
    }

    #[tokio::test]
    async fn plugin_exiting_early_aborts_handshake() {
        let result = PluginProcess::launch(sh("exit 1"), LIMIT).await;
        assert!(matches!(result, Err(Error::HandshakeAborted)));
    }

    #[tokio::test]
    async fn malformed_handshake_is_rejected() {
        let result = PluginProcess::launch(sh("echo 'hello world'; sleep 30"), LIMIT).await;
        assert!(matches!(result, Err(Error::InvalidHandshake { .. })));
    }

    #[tokio::test]
    async fn unreachable_plugin_has_no_client() {
        let process = PluginProcess::launch(sh("echo '1|5|tcp|127.0.0.1:1|grpc'; sleep 30"), LIMIT)
            .await
            .unwrap();

        assert!(process.client().await.is_err());
        process.kill().await;
    }

    /// Accepts connections and holds them open without ever answering.
    async fn silent_listener() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    async fn launch_wedged() -> PluginProcess {
        let addr = silent_listener().await;
        PluginProcess::launch(sh(&format!("echo '1|5|tcp|{addr}|grpc'; sleep 60")), LIMIT)
            .await
            .unwrap()
            .with_client_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn wedged_plugin_client_times_out() {
        let process = launch_wedged().await;

        let result = tokio::time::timeout(Duration::from_secs(10), process.client())
            .await
            .expect("client() must be bounded");
        assert!(matches!(result, Err(Error::Timeout { .. })));
        process.kill().await;
    }

    #[tokio::test]
    async fn soft_close_of_wedged_plugin_falls_back_to_kill() {
        use crate::server::shutdown::{ServiceHandle, ShutdownController, StopMode};

        let process = Arc::new(launch_wedged().await);

        let controller = ShutdownController::new(StopMode::GracefulPreferred);
        let handle = ServiceHandle::new().with_plugin_client(process.clone());
        let close = handle.close(&controller);
        tokio::time::timeout(Duration::from_secs(10), close)
            .await
            .expect("close must not hang on a wedged plugin")
            .unwrap();

        assert!(process.has_exited().await.unwrap());
    }
}
