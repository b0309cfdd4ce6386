use std::fs;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use phenix_bridge::commands::ConsoleCommand;
use phenix_bridge::{BridgeConfig, DeviceId, DeviceRegistry, RegistryError, TcpDeviceProvider};

#[derive(Parser)]
#[command(name = "phenix-bridge", about = "Secure bridge to Phenix devices")]
struct Args {
    /// Path to configuration file (TOML)
    #[arg(short, long)]
    config: Option<String>,

    /// Device bridge address to connect to (repeatable), added to config
    #[arg(long)]
    connect: Vec<String>,

    /// Address to accept device links on, overrides config
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr; stdout carries the event stream
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "phenix_bridge=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        let content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read config file: {}", config_path))?;
        BridgeConfig::from_toml(&content)
            .with_context(|| format!("invalid config file: {}", config_path))?
    } else {
        BridgeConfig::default()
    };

    // CLI overrides
    config.connect.extend(args.connect);
    if let Some(listen) = args.listen {
        config.listen = Some(listen);
    }
    config.validate().context("invalid configuration")?;

    info!("Phenix bridge starting");
    info!(
        devices = config.connect.len(),
        listen = config.listen.as_deref().unwrap_or("-"),
        handshake_timeout_ms = config.session.handshake_timeout_ms,
        rotation_interval_secs = config.session.rotation_interval_secs,
    );

    let (registry, mut events) = DeviceRegistry::new(config.session_config());
    let maintenance = registry.spawn_maintenance(config.tick_interval());

    // Event stream as JSON lines
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => error!("failed to serialize event: {}", e),
            }
        }
    });

    for addr in &config.connect {
        let provider = TcpDeviceProvider::new(addr.clone(), config.connect_timeout());
        match registry.request_device(&provider).await {
            Ok(device_id) => info!(device_id, addr = %addr, "device requested"),
            Err(e) => warn!(addr = %addr, "failed to connect device: {}", e),
        }
    }

    if let Some(listen) = &config.listen {
        let listener = TcpListener::bind(listen)
            .await
            .with_context(|| format!("failed to bind TCP on {}", listen))?;
        info!("accepting device links on {}", listen);
        tokio::spawn(accept_loop(listener, registry.clone()));
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line.context("failed to read stdin")? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => {
                        if !run_command(&registry, &line).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    maintenance.abort();
    registry.shutdown();
    Ok(())
}

async fn accept_loop(listener: TcpListener, registry: Arc<DeviceRegistry>) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(result) => result,
            Err(e) => {
                error!("TCP accept error: {}", e);
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            warn!(peer = %peer_addr, "failed to set nodelay: {}", e);
        }
        if let Err(e) = registry.connect(stream, peer_addr.to_string()).await {
            error!(peer = %peer_addr, "failed to start device session: {}", e);
        }
    }
}

/// Execute one console line. Returns false when the bridge should exit.
async fn run_command(registry: &Arc<DeviceRegistry>, line: &str) -> bool {
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("{e}");
            return true;
        }
    };

    let result: Result<(), RegistryError> = match command {
        ConsoleCommand::Send { device_id, text } => {
            registry.send_secure_message(device_id, &text).await
        }
        ConsoleCommand::Command {
            device_id,
            code,
            data,
        } => registry.send_command(device_id, code, &data).await,
        ConsoleCommand::Rekey(device_id) => registry.rekey(device_id).await,
        ConsoleCommand::Disconnect(device_id) => registry.disconnect(device_id),
        ConsoleCommand::List => {
            for device_id in registry.connected_devices() {
                print_info(registry, device_id);
            }
            Ok(())
        }
        ConsoleCommand::Info(device_id) => {
            print_info(registry, device_id);
            Ok(())
        }
        ConsoleCommand::Quit => return false,
    };

    if let Err(e) = result {
        eprintln!("{e}");
    }
    true
}

fn print_info(registry: &DeviceRegistry, device_id: DeviceId) {
    match registry.device_info(device_id) {
        Ok(info) => match serde_json::to_string(&info) {
            Ok(line) => println!("{line}"),
            Err(e) => error!("failed to serialize device info: {}", e),
        },
        Err(e) => eprintln!("{e}"),
    }
}
