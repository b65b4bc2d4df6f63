//! End-to-end sessions against the in-process stand-in provider.

use reattach_server::{
    reattach_core::{
        ConnectionDescriptor, Error, ReattachProviders, types::PLUGIN_HEALTH_SERVICE,
        types::REATTACH_PROVIDERS_ENV,
    },
    server::{
        env::CommandEnv,
        orchestrator::{OrchestratorConfig, run_plugin_command},
        provider::reflection_plugin,
        serve::{InProcessServer, ListenerKind},
        shutdown::{ServiceHandle, ShutdownController, StopMode},
    },
};
use parking_lot::Mutex;
use std::time::Duration;
use tonic_health::pb::{
    HealthCheckRequest, health_check_response::ServingStatus, health_client::HealthClient,
};

const PLUGIN: &str = "terraform-provider-plugintest";

async fn check_health(descriptor: &ConnectionDescriptor) -> Result<i32, Error> {
    let channel = descriptor.connect().await?;
    let response = HealthClient::new(channel)
        .check(HealthCheckRequest {
            service: PLUGIN_HEALTH_SERVICE.to_string(),
        })
        .await?;
    Ok(response.into_inner().status)
}

fn published_descriptor(env: &CommandEnv) -> ConnectionDescriptor {
    let value = env.get(REATTACH_PROVIDERS_ENV).unwrap();
    let providers = ReattachProviders::from_env_value(&value).unwrap();
    let config = providers.get("hashicorp/plugintest").cloned().unwrap();
    ConnectionDescriptor::try_from(config).unwrap()
}

async fn session_reaches_live_server(listener: ListenerKind) {
    let env = CommandEnv::new(PLUGIN);
    let seen = Mutex::new(None);

    run_plugin_command(
        &OrchestratorConfig::default(),
        &env,
        reflection_plugin().unwrap(),
        listener,
        || async {
            let descriptor = published_descriptor(&env);
            assert!(descriptor.test);
            assert_eq!(descriptor.pid, std::process::id());
            assert_eq!(
                check_health(&descriptor).await?,
                ServingStatus::Serving as i32
            );
            *seen.lock() = Some(descriptor);
            Ok::<_, Error>(())
        },
    )
    .await
    .unwrap();

    assert_eq!(env.get(REATTACH_PROVIDERS_ENV), None);
    let descriptor = seen.into_inner().unwrap();
    assert!(check_health(&descriptor).await.is_err());
}

#[tokio::test]
async fn tcp_session_reaches_live_server() {
    session_reaches_live_server(ListenerKind::Tcp).await;
}

#[cfg(unix)]
#[tokio::test]
async fn unix_session_reaches_live_server() {
    session_reaches_live_server(ListenerKind::Unix).await;
}

#[tokio::test]
async fn sequential_sessions_share_a_working_dir() {
    let env = CommandEnv::new(PLUGIN);
    let addresses = Mutex::new(Vec::new());

    for _ in 0..2 {
        run_plugin_command(
            &OrchestratorConfig::default(),
            &env,
            reflection_plugin().unwrap(),
            ListenerKind::Tcp,
            || async {
                addresses.lock().push(published_descriptor(&env).address);
                Ok::<_, Error>(())
            },
        )
        .await
        .unwrap();
    }

    assert_eq!(addresses.lock().len(), 2);
    assert_eq!(env.get(REATTACH_PROVIDERS_ENV), None);
}

#[cfg(unix)]
#[tokio::test]
async fn failing_command_still_tears_down() {
    let env = CommandEnv::new(PLUGIN);
    let address = Mutex::new(None);

    let result = run_plugin_command(
        &OrchestratorConfig {
            handshake_timeout: Duration::from_secs(5),
            ..OrchestratorConfig::default()
        },
        &env,
        reflection_plugin().unwrap(),
        ListenerKind::Unix,
        || async {
            *address.lock() = Some(published_descriptor(&env).address);
            env.command("sh", ["-c", "test -n \"$TF_REATTACH_PROVIDERS\" && exit 3"])
                .status()
                .await
                .map_err(Error::from)
                .and_then(|status| match status.code() {
                    Some(0) => Ok(()),
                    _ => Err(Error::Command(format!("exited with {status}").into())),
                })
        },
    )
    .await;

    assert!(matches!(result, Err(Error::Command(_))));
    assert_eq!(env.get(REATTACH_PROVIDERS_ENV), None);
    let address = address.into_inner().unwrap();
    assert!(!std::path::Path::new(&address).exists());
}

#[tokio::test]
async fn handle_stops_embedded_server() {
    let server = InProcessServer::start(
        reflection_plugin().unwrap(),
        ListenerKind::Tcp,
        Duration::from_secs(2),
    )
    .await
    .unwrap();
    let descriptor = server.descriptor().clone();
    assert_eq!(
        check_health(&descriptor).await.unwrap(),
        ServingStatus::Serving as i32
    );

    ServiceHandle::new()
        .with_embedded_server(server)
        .close(&ShutdownController::new(StopMode::GracefulPreferred))
        .await
        .unwrap();

    assert!(check_health(&descriptor).await.is_err());
}
