//! Peer-pod SSH server.
//!
//! The server runs two phases on one listener. During the attestation phase
//! it accepts a connection using an ephemeral host key, exposes the
//! attestation-phase tunnels and fetches its real keys through the `KBS`
//! tunnel. Once both keys are available it asks the worker node to upgrade
//! and switches to the kubernetes phase, where only the worker node's key is
//! accepted and the fetched host key is presented. The kubernetes phase
//! accepts one connection at a time until shutdown.

use crate::secrets::{GetSecret, PpSecrets};
use securecomms_core::config::{
    HANDSHAKE_TIMEOUT, PP_PRIVATE_KEY_RESOURCE, PP_SECURE_COMMS_VERSION, RESTART_DELAY,
    WN_PUBLIC_KEY_RESOURCE,
};
use securecomms_core::keys::{generate_rsa, marshal_public_key, parse_authorized_key, parse_private_key};
use securecomms_core::{CommsError, ForwarderConfig, Result, Role};
use securecomms_runtime::{accept, ClientAuth, InboundSet, OutboundSet, Peer, ServerSettings};
use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Claim the once-per-boot sentinel at `path`.
pub fn singleton(path: &Path) -> Result<()> {
    match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(CommsError::ConfigError(format!(
            "SSH service runs in singleton mode and {} already exists",
            path.display()
        ))),
        Err(e) => Err(CommsError::ConfigError(format!(
            "failed to create singleton file {}: {}",
            path.display(),
            e
        ))),
    }
}

/// Server settings for the kubernetes phase from the fetched keys.
pub fn kubernetes_settings(pp_private_key: &[u8], wn_public_key: &[u8]) -> Result<ServerSettings> {
    if pp_private_key.is_empty() || wn_public_key.is_empty() {
        return Err(CommsError::KeyError("kubernetes phase: missing SSH server key".to_string()));
    }
    let wn_key = parse_authorized_key(wn_public_key)?;
    let host_key = parse_private_key(pp_private_key)?;
    Ok(ServerSettings::new(
        host_key,
        ClientAuth::PublicKey(marshal_public_key(&wn_key)),
    ))
}

/// The two-phase SSH server.
pub struct SshServer {
    config: ForwarderConfig,
    inbounds: InboundSet,
    outbounds: OutboundSet,
    source: Arc<dyn GetSecret>,
    ready: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<Result<()>>>>,
}

impl SshServer {
    /// Parse the tags and bind every inbound.
    pub async fn new(config: ForwarderConfig, source: Arc<dyn GetSecret>) -> Result<Self> {
        tracing::info!(version = PP_SECURE_COMMS_VERSION, "Using PP SecureComms");

        let inbounds = InboundSet::new();
        inbounds.add_tags(&config.inbounds, None).await?;
        let mut outbounds = OutboundSet::new();
        outbounds.add_tags(&config.outbounds)?;

        let (ready, _) = watch::channel(false);
        Ok(Self {
            config,
            inbounds,
            outbounds,
            source,
            ready,
            task: Mutex::new(None),
        })
    }

    /// Flips to `true` once the SSH port is listening.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn inbound_port(&self, name: &str) -> Option<u16> {
        self.inbounds.port(name)
    }

    /// Listen on the SSH port and run both phases in the background.
    ///
    /// Returns the bound address. A bind failure is returned as is.
    pub async fn start(self: &Arc<Self>, cancel: &CancellationToken) -> Result<SocketAddr> {
        let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, self.config.ssh_port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            CommsError::TransportError(format!("failed to listen on {}: {}", addr, e))
        })?;
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "SSH service started");
        self.ready.send_replace(true);

        let handle = tokio::spawn(self.clone().run(listener, cancel.child_token()));
        *self.task.lock().await = Some(handle);
        Ok(addr)
    }

    /// Wait for the phase loop to end, then release the inbounds.
    ///
    /// Returns the error that stopped the loop, if any.
    pub async fn wait(&self) -> Result<()> {
        let handle = self.task.lock().await.take();
        let result = match handle {
            Some(handle) => handle
                .await
                .map_err(|e| CommsError::TransportError(format!("SSH service task failed: {}", e)))?,
            None => Ok(()),
        };
        self.inbounds.del_all();
        self.inbounds.wait().await;
        result
    }

    async fn run(self: Arc<Self>, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let settings = match self.attestation_phase(&listener, &cancel).await? {
            Some(settings) => settings,
            None => return Ok(()),
        };
        self.kubernetes_phase(&listener, &settings, &cancel).await;
        tracing::info!("SSH service stopped");
        Ok(())
    }

    /// Build attestation settings with a fresh host key.
    async fn attestation_settings(&self) -> Result<ServerSettings> {
        let bits = self.config.host_key_bits;
        let host_key = tokio::task::spawn_blocking(move || generate_rsa(bits))
            .await
            .map_err(|e| CommsError::KeyError(format!("host key generation failed: {}", e)))??;

        let auth = match tokio::fs::read(&self.config.unproven_key_path).await {
            Ok(line) => {
                let key = parse_authorized_key(&line)?;
                ClientAuth::PublicKey(marshal_public_key(&key))
            }
            Err(_) => {
                tracing::info!("Attestation phase: SSH server initialized with no client authentication");
                ClientAuth::Any
            }
        };
        Ok(ServerSettings::new(host_key, auth))
    }

    /// Returns the kubernetes-phase settings, or `None` when cancelled.
    async fn attestation_phase(
        &self,
        listener: &TcpListener,
        cancel: &CancellationToken,
    ) -> Result<Option<ServerSettings>> {
        loop {
            let settings = self.attestation_settings().await?;
            let Some(peer) = next_peer(listener, &settings, Role::Attestation, cancel).await else {
                return Ok(None);
            };
            peer.add_tags(&self.inbounds, &self.outbounds);
            peer.ready();

            let mut secrets = PpSecrets::new(self.source.clone());
            secrets.add_key(WN_PUBLIC_KEY_RESOURCE);
            secrets.add_key(PP_PRIVATE_KEY_RESOURCE);

            tracing::info!("Attestation phase: getting keys from KBS");
            let fetched = tokio::select! {
                fetched = secrets.go(cancel) => fetched,
                _ = peer.closed() => {
                    tracing::info!("Attestation phase: peer left before keys were fetched");
                    peer.wait().await;
                    continue;
                }
            };
            if let Err(e) = fetched {
                tracing::info!(error = %e, "Attestation phase: stopped getting keys");
                peer.close("cancelled");
                peer.wait().await;
                return Ok(None);
            }

            let settings = kubernetes_settings(
                secrets.get_key(PP_PRIVATE_KEY_RESOURCE).unwrap_or_default(),
                secrets.get_key(WN_PUBLIC_KEY_RESOURCE).unwrap_or_default(),
            );
            match settings {
                Ok(settings) => {
                    tracing::info!("Attestation phase: kubernetes phase keys are ready");
                    if let Err(e) = peer.upgrade().await {
                        tracing::warn!(error = %e, "Attestation phase: upgrade was not acknowledged");
                    }
                    peer.close("attestation phase done");
                    peer.wait().await;
                    return Ok(Some(settings));
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Attestation phase: failed to use keys from KBS");
                    peer.close("bad keys");
                    peer.wait().await;
                }
            }
        }
    }

    async fn kubernetes_phase(
        &self,
        listener: &TcpListener,
        settings: &ServerSettings,
        cancel: &CancellationToken,
    ) {
        while let Some(peer) = next_peer(listener, settings, Role::Kubernetes, cancel).await {
            peer.add_tags(&self.inbounds, &self.outbounds);
            peer.ready();
            peer.wait().await;
            tracing::info!("Kubernetes phase: peer disconnected");
        }
    }
}

/// Accept connections until one completes the handshake and the phase
/// exchange as `role`. `None` when cancelled.
async fn next_peer(
    listener: &TcpListener,
    settings: &ServerSettings,
    role: Role,
    cancel: &CancellationToken,
) -> Option<Peer> {
    loop {
        tracing::info!("{} phase: waiting for client to connect", role);
        let stream = tokio::select! {
            _ = cancel.cancelled() => return None,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    tracing::info!(%remote, "{} phase: client connected", role);
                    stream
                }
                Err(e) => {
                    tracing::warn!(error = %e, "{} phase: failed to accept connection", role);
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(RESTART_DELAY) => continue,
                    }
                }
            },
        };

        let handshake = tokio::select! {
            _ = cancel.cancelled() => return None,
            handshake = tokio::time::timeout(HANDSHAKE_TIMEOUT, accept(stream, settings)) => handshake,
        };
        let (conn, streams) = match handshake {
            Ok(Ok(accepted)) => accepted,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "{} phase: handshake failed", role);
                continue;
            }
            Err(_) => {
                tracing::warn!("{} phase: handshake timed out", role);
                continue;
            }
        };

        match Peer::new(cancel, role, conn, streams, "").await {
            Ok(peer) => return Some(peer),
            Err(e) => tracing::warn!(error = %e, "{} phase: retrying after peer setup failed", role),
        }
    }
}
