//! VPNSE lifecycle service binary
//!
//! Hosts a lifecycle controller and reads commands (`start`, `stop`,
//! `revoke`, `restart`) line by line from stdin. On launch it behaves like
//! a process the OS restarted: the tunnel comes back up only if it was
//! running before and the environment allows it.

use log::{debug, error, info, warn};
use std::env;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use vpnse_lifecycle::{
    command::{CommandBridge, CommandEvent},
    config::Config,
    controller::{ServiceContext, VpnLifecycleController},
    engine::{ChannelEngineClient, EngineReport, EngineRequest},
    error::Result,
    intent::FileIntentStore,
    notification::LogPresenter,
    policy::{FilePolicySource, PolicySource, StaticPolicySource},
    routing::{InstalledPackages, PackageRegistry, PatternRegistry, TunnelConfigBuilder},
    tunnel::TunInterface,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let config_path = if args.len() > 2 && args[1] == "--config" {
        args[2].as_str()
    } else if args.len() > 1 && !args[1].starts_with("--") {
        args[1].as_str()
    } else {
        "config.toml"
    };

    let config = load_config(config_path)?;

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.logging.level.as_str()),
    )
    .init();
    info!("Starting {} v{}", vpnse_lifecycle::NAME, vpnse_lifecycle::VERSION);

    let (engine, mut engine_rx) = ChannelEngineClient::new();
    let controller = VpnLifecycleController::new(build_context(&config, engine));
    info!("Service session {}", controller.session_id());

    // Engine host: forwards requests and feeds reports back
    let engine_controller = controller.clone();
    let loopback = config.engine.loopback;
    tokio::spawn(async move {
        while let Some(request) = engine_rx.recv().await {
            match request {
                EngineRequest::Connect { session_id, policy } => {
                    info!(
                        "Engine connect for {session_id}: {} routes, filter {:?}",
                        policy.routes.len(),
                        policy.app_filter
                    );
                    if loopback {
                        engine_controller
                            .handle_engine_report(EngineReport::Connected)
                            .await;
                    }
                }
                EngineRequest::Disconnect { session_id } => {
                    info!("Engine disconnect for {session_id}");
                }
            }
        }
        debug!("Engine request channel closed");
    });

    let mut status_rx = controller.subscribe();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let snapshot = status_rx.borrow_and_update().clone();
            info!(
                "Status: {} (want_running={}, prepared={})",
                snapshot.status, snapshot.want_running, snapshot.prepared
            );
        }
    });

    let bridge = CommandBridge::new(Arc::new(controller.clone()));

    // A fresh process is an OS restart until told otherwise
    if let Err(e) = bridge.deliver(CommandEvent::system_restart()).await {
        error!("Restart dispatch failed: {e}");
    }

    info!("Reading commands from stdin. Press Ctrl+C to exit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match bridge.deliver_str(&line) {
                        Ok(_) => {}
                        Err(e) => warn!("{e}"),
                    },
                    Ok(None) => {
                        info!("stdin closed");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read command: {e}");
                        break;
                    }
                }
            }
        }
    }

    controller.shutdown().await;
    info!("Service stopped");
    Ok(())
}

fn load_config(path: &str) -> Result<Config> {
    let config = if Path::new(path).exists() {
        Config::from_file(path)?
    } else {
        eprintln!("Config file {path} not found, using defaults");
        Config::default()
    };
    config.validate()?;
    Ok(config)
}

fn build_context(config: &Config, engine: ChannelEngineClient) -> ServiceContext {
    let policy: Arc<dyn PolicySource> = match &config.service.policy_path {
        Some(path) => Arc::new(FilePolicySource::new(path)),
        None => Arc::new(StaticPolicySource::new(config.policy.clone())),
    };

    let registry: Arc<dyn PackageRegistry> = if config.routing.installed_packages.is_empty() {
        Arc::new(PatternRegistry)
    } else {
        Arc::new(InstalledPackages::new(
            config.routing.installed_packages.iter().cloned(),
        ))
    };

    ServiceContext {
        policy,
        engine: Arc::new(engine),
        presenter: Arc::new(LogPresenter),
        intent: Arc::new(FileIntentStore::new(&config.service.intent_path)),
        environment: Arc::new(config.environment.clone()),
        builder: TunnelConfigBuilder::new(registry)
            .with_builtin_exclusions(config.routing.builtin_exclusions.iter().cloned())
            .with_metered_support(config.service.metered_supported),
        interface: Box::new(TunInterface::new(config.tunnel.clone())),
    }
}
