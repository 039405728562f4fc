//! Worker-node SSH client.
//!
//! [`SshClient`] holds the adaptor's identity: its SSH key, read from or
//! created in the secret store, and optionally a KBS client used to publish
//! keys for peer-pods to fetch. [`SshClientInstance`] drives the connection
//! to one peer-pod: an attestation session with an unverified host key,
//! then kubernetes sessions pinned to the peer-pod's key, restarted until
//! the pod is disconnected.

use crate::kbs::KbsClient;
use crate::kubemgr::SecretStore;
use russh_keys::key::KeyPair;
use securecomms_core::backoff::{DIAL_MAX_BACKOFF, DIAL_MIN_BACKOFF};
use securecomms_core::config::{
    kbs_pp_private_key_path, pp_secret_name, ADAPTOR_SECRET_NAME, DIAL_ATTEMPTS,
    HANDSHAKE_TIMEOUT, KBS_CLIENT_SECRET_NAME, KBS_WN_PUBLIC_KEY_PATH, PP_SECURE_COMMS_VERSION,
    RESTART_DELAY,
};
use securecomms_core::keys::{marshal_public_key, parse_authorized_key, parse_private_key};
use securecomms_core::{AdaptorConfig, Backoff, CommsError, Result, Role};
use securecomms_runtime::{connect, HostKeyCheck, InboundSet, OutboundSet, Peer};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// The adaptor's SSH identity and tunnel configuration.
pub struct SshClient {
    store: Arc<dyn SecretStore>,
    kbs: Option<KbsClient>,
    wn_key: Arc<KeyPair>,
    wn_public_key: Vec<u8>,
    config: AdaptorConfig,
}

impl SshClient {
    /// Load (or create) the adaptor keypair and, in trustee mode, publish
    /// its public key to the KBS.
    pub async fn init(store: Arc<dyn SecretStore>, config: AdaptorConfig) -> Result<Self> {
        tracing::info!(version = PP_SECURE_COMMS_VERSION, "Using PP SecureComms");

        let keys = match store.read_secret(ADAPTOR_SECRET_NAME).await? {
            Some(keys) => keys,
            None => store.create_secret(ADAPTOR_SECRET_NAME, config.key_bits).await?,
        };
        if keys.private_key.is_empty() {
            return Err(CommsError::KeyError("missing keys for PeerPod".to_string()));
        }
        let wn_key = parse_private_key(&keys.private_key)?;

        let kbs = if config.secure_comms_trustee {
            let kbs_keys = store.read_secret(KBS_CLIENT_SECRET_NAME).await?.ok_or_else(|| {
                CommsError::SecretStoreError(format!("secret '{}' not found", KBS_CLIENT_SECRET_NAME))
            })?;
            let mut kbs = KbsClient::new(&config.kbs_address);
            kbs.set_pem_secret(&kbs_keys.private_key)?;
            tracing::info!(path = KBS_WN_PUBLIC_KEY_PATH, "Updating KBS with adaptor public key");
            kbs.post_resource(KBS_WN_PUBLIC_KEY_PATH, &keys.public_key).await?;
            Some(kbs)
        } else {
            None
        };

        Ok(Self {
            store,
            kbs,
            wn_key: Arc::new(wn_key),
            wn_public_key: keys.public_key,
            config,
        })
    }

    /// The adaptor public key (`authorized_keys` line).
    pub fn wn_public_key(&self) -> &[u8] {
        &self.wn_public_key
    }

    /// Prepare the connection to peer-pod `sid`.
    ///
    /// Resumes the kubernetes phase when the pod's secret already exists.
    /// Returns the instance and the pod's private key PEM.
    pub async fn init_pp(
        &self,
        cancel: &CancellationToken,
        sid: &str,
    ) -> Result<(Arc<SshClientInstance>, Vec<u8>)> {
        let name = pp_secret_name(sid);
        tracing::info!(%name, "InitPP read/create PP secret");
        let (keys, kubernetes_phase) = match self.store.read_secret(&name).await? {
            Some(keys) => (keys, true),
            None => (self.store.create_secret(&name, self.config.key_bits).await?, false),
        };

        if let Some(kbs) = &self.kbs {
            kbs.post_resource(&kbs_pp_private_key_path(sid), &keys.private_key)
                .await?;
        }

        let pp_public_key = if keys.public_key.is_empty() {
            marshal_public_key(&parse_private_key(&keys.private_key)?.clone_public_key()?)
        } else {
            marshal_public_key(&parse_authorized_key(&keys.public_key)?)
        };

        let inbounds = InboundSet::new();
        let mut inbound_ports = HashMap::new();
        inbounds
            .add_tags(&self.config.inbounds, Some(&mut inbound_ports))
            .await?;
        let mut outbounds = OutboundSet::new();
        outbounds.add_tags(&self.config.outbounds)?;

        let instance = SshClientInstance {
            sid: sid.to_string(),
            pp_public_key,
            wn_key: self.wn_key.clone(),
            ssh_port: self.config.ssh_port,
            store: self.store.clone(),
            cancel: cancel.child_token(),
            tracker: TaskTracker::new(),
            kubernetes_phase: AtomicBool::new(kubernetes_phase),
            inbounds,
            outbounds,
            inbound_ports,
            pp_addrs: parking_lot::Mutex::new(Vec::new()),
        };
        Ok((Arc::new(instance), keys.private_key))
    }
}

/// The worker-node side of one peer-pod connection.
pub struct SshClientInstance {
    sid: String,
    /// Pinned host key (SSH wire encoding)
    pp_public_key: Vec<u8>,
    wn_key: Arc<KeyPair>,
    ssh_port: u16,
    store: Arc<dyn SecretStore>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    kubernetes_phase: AtomicBool,
    inbounds: InboundSet,
    outbounds: OutboundSet,
    inbound_ports: HashMap<String, u16>,
    pp_addrs: parking_lot::Mutex<Vec<SocketAddr>>,
}

impl SshClientInstance {
    pub fn sid(&self) -> &str {
        &self.sid
    }

    /// Actual local port of inbound `name`.
    pub fn get_port(&self, name: &str) -> Option<u16> {
        self.inbound_ports.get(name).copied()
    }

    pub fn is_kubernetes_phase(&self) -> bool {
        self.kubernetes_phase.load(Ordering::SeqCst)
    }

    /// Peer-pod addresses dialed by the following sessions, in order.
    pub fn set_pp_addrs(&self, addrs: &[IpAddr]) {
        *self.pp_addrs.lock() = addrs
            .iter()
            .map(|ip| SocketAddr::new(*ip, self.ssh_port))
            .collect();
    }

    /// Run the attestation phase if still pending, then keep a kubernetes
    /// session up in the background until [`disconnect_pp`].
    ///
    /// [`disconnect_pp`]: SshClientInstance::disconnect_pp
    pub async fn start(self: &Arc<Self>, addrs: &[IpAddr]) -> Result<()> {
        self.set_pp_addrs(addrs);

        if !self.is_kubernetes_phase() {
            tracing::info!("Attestation phase: starting");
            self.start_attestation().await.map_err(|e| {
                CommsError::ProtocolError(format!("attestation phase failed: {}", e))
            })?;
            tracing::info!("Attestation phase: done");
            self.kubernetes_phase.store(true, Ordering::SeqCst);
        }

        let this = self.clone();
        self.tracker.spawn(async move {
            let mut restarts = 0u32;
            while !this.cancel.is_cancelled() {
                tracing::info!(restarts, "Kubernetes phase: starting");
                if let Err(e) = this.start_kubernetes().await {
                    tracing::warn!(error = %e, "Kubernetes phase: failed");
                }
                tokio::select! {
                    _ = this.cancel.cancelled() => break,
                    _ = tokio::time::sleep(RESTART_DELAY) => {}
                }
                restarts += 1;
            }
            tracing::info!("Kubernetes phase: done");
        });
        Ok(())
    }

    /// One attestation session. Fails unless the peer-pod upgraded it.
    pub async fn start_attestation(&self) -> Result<()> {
        let peer = self.dial(Role::Attestation, HostKeyCheck::Skip).await?;
        peer.add_tags(&self.inbounds, &self.outbounds);
        peer.ready();
        peer.wait().await;
        if !peer.is_upgraded() {
            return Err(CommsError::ProtocolError(
                "attestation phase closed without being upgraded".to_string(),
            ));
        }
        Ok(())
    }

    /// One kubernetes session, until the connection closes.
    pub async fn start_kubernetes(&self) -> Result<()> {
        let check = HostKeyCheck::Pinned(self.pp_public_key.clone());
        let peer = self.dial(Role::Kubernetes, check).await?;
        peer.add_tags(&self.inbounds, &self.outbounds);
        peer.ready();
        peer.wait().await;
        Ok(())
    }

    /// Stop every session, release the inbounds and delete the pod secret.
    pub async fn disconnect_pp(&self, sid: &str) -> Result<()> {
        self.inbounds.del_all();
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        self.inbounds.wait().await;
        tracing::info!(sid, "SshClientInstance DisconnectPP success");

        self.store.delete_secret(&pp_secret_name(sid)).await
    }

    /// Dial the peer-pod addresses in order until one completes the
    /// handshake and the phase exchange.
    async fn dial(&self, role: Role, check: HostKeyCheck) -> Result<Peer> {
        let addrs = self.pp_addrs.lock().clone();
        if addrs.is_empty() {
            return Err(CommsError::ConfigError(format!("{} phase: no peer-pod address", role)));
        }

        let mut backoff = Backoff::new(DIAL_MIN_BACKOFF, DIAL_MAX_BACKOFF);
        for attempt in 1..=DIAL_ATTEMPTS {
            for addr in &addrs {
                let session = tokio::select! {
                    _ = self.cancel.cancelled() => {
                        return Err(CommsError::Cancelled(format!("{} phase: dialing {}", role, addr)));
                    }
                    session = self.session(role, *addr, check.clone()) => session,
                };
                match session {
                    Ok(peer) => return Ok(peer),
                    Err(e) if !e.is_transient() => return Err(e),
                    Err(e) => tracing::info!(%addr, attempt, error = %e, "{} phase: unable to connect", role),
                }
            }
            if attempt == DIAL_ATTEMPTS {
                break;
            }
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(CommsError::Cancelled(format!("{} phase: dialing", role)));
                }
                _ = tokio::time::sleep(backoff.next_delay()) => {}
            }
        }
        Err(CommsError::TransportError(format!(
            "{} phase: peer-pod unreachable after {} attempts",
            role, DIAL_ATTEMPTS
        )))
    }

    async fn session(&self, role: Role, addr: SocketAddr, check: HostKeyCheck) -> Result<Peer> {
        let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CommsError::TimeoutError(format!("dialing {}", addr)))??;
        tracing::info!(%addr, "{} phase: ssh connected", role);

        let (conn, streams) = tokio::time::timeout(
            HANDSHAKE_TIMEOUT,
            connect(stream, check, self.wn_key.clone()),
        )
        .await
        .map_err(|_| CommsError::TimeoutError(format!("SSH handshake with {}", addr)))??;

        Peer::new(&self.cancel, role, conn, streams, self.sid.clone()).await
    }
}
