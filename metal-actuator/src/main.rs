//! metal-actuator: runs one Machine actuator call against Equinix Metal.
//!
//! The Machine is read from and written back to a JSON document; secrets
//! come from a directory laid out as `<namespace>/<name>/<key>`. Events are
//! written to the log.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metal_actuator::config::DEFAULT_EVENT_COMPONENT;
use metal_actuator::device::metal::DEFAULT_API_URL;
use metal_actuator::device::{MetalClientConfig, MetalClientFactory};
use metal_actuator::error::format_duration;
use metal_actuator::events::LogEventRecorder;
use metal_actuator::secrets::DirectorySecrets;
use metal_actuator::store::FileMachineClient;
use metal_actuator::{Actuator, ActuatorConfig, ActuatorParams, Retry};

/// Equinix Metal machine actuator
#[derive(Parser, Debug)]
#[command(name = "metal-actuator", version, about)]
struct Args {
    /// Machine document (JSON), updated in place
    #[arg(long)]
    machine: PathBuf,

    /// Secrets directory (<namespace>/<name>/<key>)
    #[arg(long, default_value = "/var/run/secrets/metal")]
    secrets_dir: PathBuf,

    /// Equinix Metal API base URL
    #[arg(long, default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Requeue delay while a device is being deleted, in seconds
    #[arg(long, default_value = "20")]
    delete_requeue_secs: u64,

    /// Force deletion of devices
    #[arg(long)]
    force_delete: bool,

    /// HTTP request timeout in seconds
    #[arg(long, default_value = "30")]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone, Copy)]
enum Command {
    /// Provision a device for the machine
    Create,
    /// Converge the machine's device with its spec
    Update,
    /// Deprovision the machine's device
    Delete,
    /// Check whether the machine's device exists
    Exists,
}

fn describe(retry: Retry) -> String {
    match retry {
        Retry::Never => "never".to_string(),
        Retry::Backoff => "with backoff".to_string(),
        Retry::After(after) => format!("after {}", format_duration(&after)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "metal_actuator=info,metal_apis=info,reqwest=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let client_config = MetalClientConfig {
        base_url: args.api_url.clone(),
        timeout: Duration::from_secs(args.timeout_secs),
        ..Default::default()
    };
    let device_services =
        MetalClientFactory::new(client_config).context("Failed to build Equinix Metal client")?;

    let machine_client = Arc::new(FileMachineClient::new(&args.machine));
    let mut machine = machine_client
        .load()
        .await
        .with_context(|| format!("Failed to load machine from {}", args.machine.display()))?;

    let actuator = Actuator::new(ActuatorParams {
        machine_client: machine_client.clone(),
        secrets: Arc::new(DirectorySecrets::new(&args.secrets_dir)),
        event_recorder: Arc::new(LogEventRecorder::new(DEFAULT_EVENT_COMPONENT)),
        device_services: Arc::new(device_services),
        config: ActuatorConfig {
            delete_requeue_after: Duration::from_secs(args.delete_requeue_secs),
            force_delete: args.force_delete,
        },
    });

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            interrupt.cancel();
        }
    });

    info!(
        "Running {:?} for machine {}/{} ({})",
        args.command,
        machine.namespace(),
        machine.name(),
        args.api_url
    );

    let result = match args.command {
        Command::Create => actuator.create(&cancel, &mut machine).await.map(|()| None),
        Command::Update => actuator.update(&cancel, &mut machine).await.map(|()| None),
        Command::Delete => actuator.delete(&cancel, &mut machine).await.map(|()| None),
        Command::Exists => actuator.exists(&cancel, &machine).await.map(Some),
    };

    match result {
        Ok(Some(exists)) => {
            println!("{}", exists);
            Ok(())
        }
        Ok(None) => {
            println!("ok");
            Ok(())
        }
        Err(err) => {
            error!("{:?} failed: {}", args.command, err);
            println!("retry: {}", describe(err.retry()));
            Err(err).with_context(|| format!("{:?} of machine {} failed", args.command, machine.name()))
        }
    }
}
