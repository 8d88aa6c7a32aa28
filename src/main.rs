//! jumpforward command line front end
//!
//! Loads a tunnel configuration (a JSON file or an `ssh -L ...` command
//! line), starts the tunnel and keeps it up until Ctrl-C or until the jump
//! host connection is lost.

// Use mimalloc as the global allocator for better performance
// with high-frequency small allocations (relay buffers, channel messages)
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use jumpforward::auth::{PromptResponse, MAX_PROMPT_ATTEMPTS};
use jumpforward::config::{
    default_config_path, export_batch, parse_command, render_command, ConfigStorage,
    KeyringStore, MemoryStore, SecretStore,
};
use jumpforward::ssh::SshTransportFactory;
use jumpforward::{ControllerOptions, TunnelConfig, TunnelController, TunnelEvent, TunnelState};

/// Forward local ports through a single SSH jump host
#[derive(Parser, Debug)]
#[command(name = "jumpforward", version, about)]
struct Cli {
    /// Tunnel configuration file (defaults to the last used configuration)
    #[arg(value_name = "CONFIG")]
    config: Option<PathBuf>,

    /// Build the configuration from an `ssh ... -L l:h:r` command line
    #[arg(long, value_name = "SSH_COMMAND", conflicts_with = "config")]
    from_command: Option<String>,

    /// Print the equivalent ssh command and exit
    #[arg(long)]
    print_command: bool,

    /// Write the equivalent ssh command to a .bat file and exit
    #[arg(long, value_name = "FILE")]
    export_batch: Option<PathBuf>,

    /// Save the configuration as JSON and exit
    #[arg(long, value_name = "FILE")]
    save: Option<PathBuf>,

    /// Interface the forwarded ports listen on
    #[arg(long, value_name = "ADDR", default_value = "0.0.0.0")]
    bind: String,

    /// Reject unknown jump host keys instead of learning them
    #[arg(long)]
    strict_host_keys: bool,

    /// Do not read or store passphrases in the system keychain
    #[arg(long)]
    no_keyring: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

async fn load_config(cli: &Cli) -> Result<TunnelConfig> {
    if let Some(command) = &cli.from_command {
        return parse_command(command).context("Failed to parse ssh command");
    }

    let path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path().context("Failed to locate the last used configuration")?,
    };
    ConfigStorage::with_path(&path)
        .load()
        .await
        .with_context(|| format!("Failed to load config from {}", path.display()))?
        .with_context(|| format!("No configuration found at {}", path.display()))
}

fn prompt_passphrase(key_path: &Path, attempt: u32) -> PromptResponse {
    let prompt = format!(
        "Passphrase for {} ({}/{}): ",
        key_path.display(),
        attempt,
        MAX_PROMPT_ATTEMPTS
    );
    match rpassword::prompt_password(prompt) {
        Ok(passphrase) if !passphrase.is_empty() => PromptResponse::passphrase(passphrase),
        Ok(_) => PromptResponse::Abort,
        Err(e) => {
            warn!("Could not read passphrase: {}", e);
            PromptResponse::Abort
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_config(&cli).await?;
    config.validate().context("Invalid tunnel configuration")?;

    let mut handled = false;
    if cli.print_command {
        println!("{}", render_command(&config));
        handled = true;
    }
    if let Some(path) = &cli.export_batch {
        let written = export_batch(&config, path).await?;
        println!("Wrote {}", written.display());
        handled = true;
    }
    if let Some(path) = &cli.save {
        let storage = ConfigStorage::with_path(path);
        storage
            .save(&config)
            .await
            .with_context(|| format!("Failed to save config to {}", path.display()))?;
        println!("Saved {}", storage.path().display());
        handled = true;
    }
    if handled {
        return Ok(());
    }

    let secrets: Arc<dyn SecretStore> = if cli.no_keyring {
        Arc::new(MemoryStore::new())
    } else {
        Arc::new(KeyringStore::new())
    };

    let options = ControllerOptions {
        bind_address: cli.bind.clone(),
        strict_host_key_checking: cli.strict_host_keys,
        last_used_path: default_config_path().ok(),
        ..Default::default()
    };

    let controller = TunnelController::new(
        Arc::new(SshTransportFactory),
        secrets,
        Arc::new(prompt_passphrase),
        options,
    );
    let mut events = controller.subscribe();

    controller
        .start(config)
        .await
        .context("Failed to start tunnel")?;

    for status in controller.stats().await {
        let label = if status.mapping.label.is_empty() {
            String::new()
        } else {
            format!(" ({})", status.mapping.label)
        };
        println!(
            "{} -> {}:{}{}",
            status.bound_addr, status.mapping.remote_host, status.mapping.remote_port, label
        );
    }
    info!("Tunnel running, press Ctrl-C to stop");

    let mut lost = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                controller.stop().await;
                break;
            }
            event = events.recv() => match event {
                Ok(TunnelEvent::ConnectionLost { reason }) => {
                    error!("{}", reason);
                    lost = Some(reason);
                }
                Ok(TunnelEvent::ChannelOpenFailed { local_port, remote }) => {
                    warn!("Connection on port {} to {} was refused", local_port, remote);
                }
                Ok(TunnelEvent::StateChanged { state: TunnelState::Idle }) => break,
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!("Missed {} tunnel events", skipped),
                Err(RecvError::Closed) => break,
            }
        }
    }

    if let Some(reason) = lost {
        bail!("Tunnel closed: {}", reason);
    }
    Ok(())
}
