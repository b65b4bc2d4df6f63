use anyhow::{Context, anyhow};
use clap::Parser;
use reattach_server::{
    reattach_core::{ReattachProviders, registry_key, types::REATTACH_PROVIDERS_ENV},
    server::{
        config::{CliArgs, HarnessConfig, Mode},
        env::CommandEnv,
        orchestrator::run_plugin_command,
        process::PluginProcess,
        provider::reflection_plugin,
        serve::serve_plugin,
        shutdown::{ServiceHandle, ShutdownController},
        telemetry::init_telemetry,
    },
};
use std::sync::Arc;
use tokio::{process::Command, signal};
use tracing::{debug, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load from .env
    let _ = dotenvy::dotenv();
    let args = CliArgs::parse();
    let config = HarnessConfig::try_from(args)?;

    init_telemetry(config.log_json)?;
    log_startup_info(&config);

    match &config.mode {
        Mode::Run { command } => run(&config, command).await,
        Mode::Serve => {
            serve_plugin(reflection_plugin()?, config.listener()).await?;
            Ok(())
        }
        Mode::Launch { command } => launch(&config, command).await,
    }
}

fn log_startup_info(config: &HarnessConfig) {
    if cfg!(debug_assertions) {
        debug!("Starting plugintest with full config: {:#?}", config);
    } else {
        debug!(
            "Starting plugintest for {} ({:?})",
            config.plugin_name, config.mode
        );
    }
}

/// Serves the stand-in provider in-process for the duration of `command`.
async fn run(config: &HarnessConfig, command: &[String]) -> anyhow::Result<()> {
    let (program, args) = command.split_first().context("missing command")?;
    let env = CommandEnv::new(config.plugin_name.as_str());

    run_plugin_command(
        &config.orchestrator(),
        &env,
        reflection_plugin()?,
        config.listener(),
        || run_command(&env, program, args),
    )
    .await?;

    info!("Command finished successfully");
    Ok(())
}

async fn run_command(env: &CommandEnv, program: &str, args: &[String]) -> anyhow::Result<()> {
    let status = env
        .command(program, args)
        .status()
        .await
        .with_context(|| format!("failed to start `{program}`"))?;

    if !status.success() {
        return Err(anyhow!("`{program}` exited with {status}"));
    }
    Ok(())
}

/// Acts as a minimal plugin host: launches `command`, prints the value a host
/// needs to reattach to it and closes it on Ctrl+C.
async fn launch(config: &HarnessConfig, command: &[String]) -> anyhow::Result<()> {
    let (program, args) = command.split_first().context("missing command")?;
    let mut child = Command::new(program);
    child.args(args);

    let process = Arc::new(PluginProcess::launch(child, config.handshake_timeout).await?);

    let key = registry_key(&config.plugin_name, &config.namespace);
    let value = ReattachProviders::single(key, process.descriptor()).to_env_value()?;
    println!("{REATTACH_PROVIDERS_ENV}='{value}'");
    info!(pid = process.pid(), "Plugin running, press Ctrl+C to stop");

    signal::ctrl_c().await?;
    info!("Received Ctrl+C signal");

    ServiceHandle::new()
        .with_plugin_client(process)
        .close(&ShutdownController::new(config.stop_mode()))
        .await?;

    info!("Plugin stopped");
    Ok(())
}
