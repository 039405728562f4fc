//! Worker-node secure comms adaptor.
//!
//! Connects to one peer-pod: prepares its keys, runs the attestation phase
//! when needed, then keeps the kubernetes phase up until interrupted, at
//! which point the pod's secret is removed.

use anyhow::Context;
use clap::Parser;
use securecomms_adaptor::{KubeSecretStore, SecretStore, SshClient};
use securecomms_core::config::DEFAULT_SSH_PORT;
use securecomms_core::keys::DEFAULT_RSA_BITS;
use securecomms_core::AdaptorConfig;
use std::net::IpAddr;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "securecomms-adaptor", version, about = "Worker-node secure comms adaptor")]
struct Args {
    /// Peer-pod session id
    #[arg(long, env = "SECURE_COMMS_SID")]
    sid: String,

    /// Peer-pod addresses, tried in order
    #[arg(long = "pp-addr", env = "SECURE_COMMS_PP_ADDRS", value_delimiter = ',', required = true)]
    pp_addrs: Vec<IpAddr>,

    /// Inbound tags, comma separated
    #[arg(
        long,
        env = "SECURE_COMMS_INBOUNDS",
        value_delimiter = ',',
        default_value = "KUBERNETES_PHASE:KATAAGENT:0"
    )]
    inbounds: Vec<String>,

    /// Outbound tags, comma separated
    #[arg(long, env = "SECURE_COMMS_OUTBOUNDS", value_delimiter = ',', default_value = "BOTH_PHASES:KBS:8080")]
    outbounds: Vec<String>,

    /// Publish keys to a trustee KBS
    #[arg(long, env = "SECURE_COMMS_TRUSTEE")]
    trustee: bool,

    /// KBS address (host:port)
    #[arg(long, env = "SECURE_COMMS_KBS_ADDR", default_value = "127.0.0.1:8080")]
    kbs_address: String,

    /// Peer-pod SSH port
    #[arg(long, env = "SECURE_COMMS_SSH_PORT", default_value_t = DEFAULT_SSH_PORT)]
    ssh_port: u16,

    /// Only use the in-cluster service account
    #[arg(long)]
    in_cluster: bool,

    /// Skip KubeApi certificate verification (kubeconfig mode)
    #[arg(long)]
    skip_verify: bool,
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

    let args = Args::parse();
    info!(version = env!("CARGO_PKG_VERSION"), "securecomms-adaptor starting");

    if let Err(e) = run(args).await {
        error!("Adaptor failed: {:#}", e);
        process::exit(1);
    }

    info!("Adaptor stopped");
}

async fn run(args: Args) -> anyhow::Result<()> {
    let store: Arc<dyn SecretStore> = if args.in_cluster {
        Arc::new(KubeSecretStore::in_cluster().await?)
    } else {
        Arc::new(KubeSecretStore::from_kubeconfig(args.skip_verify).await?)
    };

    let config = AdaptorConfig {
        inbounds: args.inbounds,
        outbounds: args.outbounds,
        secure_comms_trustee: args.trustee,
        kbs_address: args.kbs_address,
        ssh_port: args.ssh_port,
        key_bits: DEFAULT_RSA_BITS,
    };
    let client = SshClient::init(store, config)
        .await
        .context("failed to initialise the SSH client")?;

    let cancel = CancellationToken::new();
    let (instance, _) = client
        .init_pp(&cancel, &args.sid)
        .await
        .with_context(|| format!("failed to prepare peer-pod {}", args.sid))?;

    let interrupted = tokio::select! {
        started = instance.start(&args.pp_addrs) => {
            started.context("failed to start the peer-pod connection")?;
            false
        }
        _ = tokio::signal::ctrl_c() => true,
    };
    if !interrupted {
        tokio::signal::ctrl_c().await.context("failed to wait for interrupt")?;
    }
    info!("Received interrupt, shutting down");

    instance
        .disconnect_pp(&args.sid)
        .await
        .context("failed to disconnect the peer-pod")?;
    Ok(())
}
