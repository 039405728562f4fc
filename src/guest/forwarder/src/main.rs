//! Peer-pod secure comms forwarder.
//!
//! Claims the once-per-boot singleton, binds the inbounds, then serves the
//! worker node over SSH until interrupted.

use clap::Parser;
use securecomms_core::config::{
    DEFAULT_API_PORT, DEFAULT_SSH_PORT, SINGLETON_PATH, UNPROVEN_WN_PUBLIC_KEY_PATH,
};
use securecomms_core::keys::ATTESTATION_RSA_BITS;
use securecomms_core::{ForwarderConfig, Result};
use securecomms_guest::{singleton, ApiClient, SshServer};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "securecomms-forwarder", version, about = "Peer-pod secure comms forwarder")]
struct Args {
    /// Inbound tags, comma separated
    #[arg(long, env = "SECURE_COMMS_INBOUNDS", value_delimiter = ',', default_value = "BOTH_PHASES:KBS:8080")]
    inbounds: Vec<String>,

    /// Outbound tags, comma separated
    #[arg(
        long,
        env = "SECURE_COMMS_OUTBOUNDS",
        value_delimiter = ',',
        default_value = "KUBERNETES_PHASE:KATAAGENT:127.0.0.1:15150"
    )]
    outbounds: Vec<String>,

    /// SSH listen port
    #[arg(long, env = "SECURE_COMMS_SSH_PORT", default_value_t = DEFAULT_SSH_PORT)]
    ssh_port: u16,

    /// Port of the in-pod resource endpoint
    #[arg(long, env = "SECURE_COMMS_API_PORT", default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// Pod network namespace name under /run/netns
    #[arg(long, env = "SECURE_COMMS_POD_NAMESPACE", default_value = "")]
    pod_namespace: String,

    /// Singleton sentinel path
    #[arg(long, default_value = SINGLETON_PATH)]
    singleton_path: PathBuf,

    /// Optional worker node key accepted during attestation
    #[arg(long, default_value = UNPROVEN_WN_PUBLIC_KEY_PATH)]
    unproven_key_path: PathBuf,
}

impl From<Args> for ForwarderConfig {
    fn from(args: Args) -> Self {
        Self {
            inbounds: args.inbounds,
            outbounds: args.outbounds,
            ssh_port: args.ssh_port,
            api_port: args.api_port,
            pod_namespace: args.pod_namespace,
            singleton_path: args.singleton_path,
            unproven_key_path: args.unproven_key_path,
            host_key_bits: ATTESTATION_RSA_BITS,
        }
    }
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config: ForwarderConfig = Args::parse().into();
    info!(version = env!("CARGO_PKG_VERSION"), "securecomms-forwarder starting");

    if let Err(e) = run(config).await {
        error!("Forwarder failed: {}", e);
        process::exit(1);
    }

    info!("Forwarder stopped");
}

async fn run(config: ForwarderConfig) -> Result<()> {
    singleton(&config.singleton_path)?;

    let api = ApiClient::new(config.api_port, config.pod_namespace_path());
    let server = Arc::new(SshServer::new(config, Arc::new(api)).await?);

    let cancel = CancellationToken::new();
    server.start(&cancel).await?;

    let signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt, shutting down");
            signal.cancel();
        }
    });

    server.wait().await
}
