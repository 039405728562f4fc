//! Peer: the per-connection pump.
//!
//! A peer owns one SSH connection. A single loop task consumes control
//! requests and channel offers; inbound workers, channel handlers and copy
//! loops are all spawned on the peer's task tracker so `wait` returns only
//! once every one of them has exited.

use crate::control::IncomingRequest;
use crate::inbound::{Inbound, InboundSet};
use crate::kbs_proxy;
use crate::outbound::{accept_raw, Outbound, OutboundSet};
use crate::pump::splice;
use crate::transport::{ChannelKind, ChannelOffer, ConnectionStreams, SshConnection};
use parking_lot::Mutex;
use securecomms_core::config::KBS_OUTBOUND;
use securecomms_core::frame::RequestKind;
use securecomms_core::{CommsError, Result, Role};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

type OutboundRegistry = Arc<HashMap<String, Arc<Outbound>>>;

struct PeerInner {
    role: Role,
    sid: String,
    conn: SshConnection,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
    upgraded: AtomicBool,
    pending_outbounds: Mutex<HashMap<String, Arc<Outbound>>>,
    /// `None` until `ready` publishes the registry.
    outbounds: watch::Sender<Option<OutboundRegistry>>,
}

/// A connected peer. Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Peer {
    /// Start pumping `conn` and exchange roles with the remote side.
    ///
    /// Fails, with the peer closed, when the remote side does not report the
    /// same role.
    pub async fn new(
        parent: &CancellationToken,
        role: Role,
        conn: SshConnection,
        streams: ConnectionStreams,
        sid: impl Into<String>,
    ) -> Result<Peer> {
        let (outbounds, _) = watch::channel(None);
        let peer = Peer {
            inner: Arc::new(PeerInner {
                role,
                sid: sid.into(),
                conn,
                cancel: parent.child_token(),
                tracker: TaskTracker::new(),
                closed: AtomicBool::new(false),
                upgraded: AtomicBool::new(false),
                pending_outbounds: Mutex::new(HashMap::new()),
                outbounds,
            }),
        };
        peer.inner.tracker.spawn(peer.clone().run(streams));

        let reply = tokio::select! {
            _ = peer.inner.cancel.cancelled() => Err(CommsError::Cancelled(format!(
                "{} phase: cancelled during phase exchange",
                role
            ))),
            reply = peer.inner.conn.request(RequestKind::Phase, true, role.as_str().as_bytes()) => reply,
        };
        match reply {
            Ok((true, payload)) if payload == role.as_str().as_bytes() => {
                tracing::info!(remote = %peer.inner.conn.remote_addr(), "{} phase: peer connected", role);
                Ok(peer)
            }
            Ok((ok, payload)) => {
                let remote_role = String::from_utf8_lossy(&payload).into_owned();
                peer.close("phase mismatch");
                Err(CommsError::ProtocolError(format!(
                    "{} phase: remote reported phase '{}' (ok={})",
                    role, remote_role, ok
                )))
            }
            Err(e) => {
                peer.close("phase request failed");
                Err(e)
            }
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Register outbounds (all phases, filtered per channel) and start a
    /// worker for every inbound whose phase allows this peer's role.
    pub fn add_tags(&self, inbounds: &InboundSet, outbounds: &OutboundSet) {
        {
            let mut pending = self.inner.pending_outbounds.lock();
            for outbound in outbounds.list() {
                pending.insert(outbound.name.clone(), outbound.clone());
            }
        }
        for inbound in inbounds.list() {
            if !inbound.phase.allows(self.inner.role) {
                tracing::debug!(name = %inbound.name, "{} phase: inbound not active", self.inner.role);
                continue;
            }
            self.inner.tracker.spawn(self.clone().serve_inbound(inbound));
        }
    }

    /// Publish the registered outbounds; pending tunnel offers proceed and
    /// later tunnels to names this role does not serve are refused at open.
    pub fn ready(&self) {
        let registry = std::mem::take(&mut *self.inner.pending_outbounds.lock());
        let role = self.inner.role;
        self.inner.outbounds.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            self.inner.conn.tunnel_filter().publish(
                registry
                    .values()
                    .filter(|outbound| outbound.phase.allows(role))
                    .map(|outbound| outbound.name.clone()),
            );
            *current = Some(Arc::new(registry));
            true
        });
    }

    /// Ask the remote side to upgrade. Closes the peer on failure.
    pub async fn upgrade(&self) -> Result<()> {
        let role = self.inner.role;
        match self.inner.conn.request(RequestKind::Upgrade, true, &[]).await {
            Ok((true, _)) => {
                self.inner.upgraded.store(true, Ordering::SeqCst);
                tracing::info!("{} phase: upgrade accepted", role);
                Ok(())
            }
            Ok((false, _)) => {
                self.close("upgrade rejected");
                Err(CommsError::ProtocolError(format!("{} phase: upgrade rejected", role)))
            }
            Err(e) => {
                self.close("upgrade failed");
                Err(e)
            }
        }
    }

    pub fn is_upgraded(&self) -> bool {
        self.inner.upgraded.load(Ordering::SeqCst)
    }

    /// Close the connection and stop every worker. Idempotent.
    pub fn close(&self, reason: &str) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(reason, "{} phase: closing peer", self.inner.role);
        self.inner.cancel.cancel();
        self.inner.conn.close();
        self.inner.tracker.close();
    }

    /// Resolves once the peer starts closing.
    pub async fn closed(&self) {
        self.inner.cancel.cancelled().await
    }

    /// Wait for the peer to close and every worker to exit.
    pub async fn wait(&self) {
        self.inner.tracker.wait().await;
        self.inner.conn.wait().await;
    }

    async fn run(self, streams: ConnectionStreams) {
        let ConnectionStreams {
            mut channels,
            mut requests,
        } = streams;
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {
                    self.close("context cancelled");
                    break;
                }
                request = requests.recv() => match request {
                    Some(request) => self.handle_request(request).await,
                    None => {
                        self.close("control channel closed");
                        break;
                    }
                },
                offer = channels.recv() => match offer {
                    Some(offer) => {
                        self.inner.tracker.spawn(self.clone().handle_offer(offer));
                    }
                    None => {
                        self.close("connection closed");
                        break;
                    }
                },
            }
        }
    }

    async fn handle_request(&self, request: IncomingRequest) {
        let role = self.inner.role;
        let answer = match &request.kind {
            RequestKind::Phase => {
                tracing::debug!(
                    remote = %String::from_utf8_lossy(&request.payload),
                    "{} phase: phase request",
                    role
                );
                (true, role.as_str().as_bytes().to_vec())
            }
            RequestKind::Upgrade if role == Role::Attestation => {
                self.inner.upgraded.store(true, Ordering::SeqCst);
                tracing::info!("{} phase: upgrade requested by peer", role);
                (true, role.as_str().as_bytes().to_vec())
            }
            RequestKind::Upgrade => {
                tracing::warn!("{} phase: rejected upgrade request", role);
                (false, Vec::new())
            }
            RequestKind::Other(kind) => {
                tracing::debug!(kind = %kind, "{} phase: rejected unknown request", role);
                (false, Vec::new())
            }
        };
        if let Err(e) = request.reply(answer.0, answer.1).await {
            tracing::warn!(error = %e, "{} phase: failed to reply to request", role);
        }
    }

    async fn registry(&self) -> Option<OutboundRegistry> {
        let mut rx = self.inner.outbounds.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => None,
            registry = async { rx.wait_for(Option::is_some).await.ok().and_then(|r| (*r).clone()) } => registry,
        }
    }

    async fn handle_offer(self, offer: ChannelOffer) {
        let role = self.inner.role;
        let name = match offer.kind {
            ChannelKind::Tunnel(name) => name,
            ChannelKind::Other(kind) => {
                tracing::info!(kind = %kind, reason = "UnknownChannelType", "{} phase: rejected channel", role);
                offer.channel.reject().await;
                return;
            }
        };

        let Some(registry) = self.registry().await else {
            offer.channel.reject().await;
            return;
        };
        let outbound = match registry.get(&name) {
            Some(outbound) if outbound.phase.allows(role) => outbound.clone(),
            _ => {
                tracing::info!(%name, reason = "UnknownChannelType", "{} phase: rejected tunnel", role);
                offer.channel.reject().await;
                return;
            }
        };

        if outbound.name == KBS_OUTBOUND {
            let stream = offer.channel.into_stream();
            let backend = outbound.addr.clone();
            let sid = self.inner.sid.clone();
            tokio::select! {
                _ = self.inner.cancel.cancelled() => {}
                served = kbs_proxy::serve(stream, backend, sid) => {
                    if let Err(e) = served {
                        tracing::debug!(error = %e, "{} phase: KBS proxy ended", role);
                    }
                }
            }
        } else {
            accept_raw(&outbound, offer.channel, &self.inner.tracker, &self.inner.cancel).await;
        }
    }

    async fn serve_inbound(self, inbound: Arc<Inbound>) {
        let mut connections = tokio::select! {
            _ = self.inner.cancel.cancelled() => return,
            connections = inbound.connections() => connections,
        };
        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                tcp = connections.next() => match tcp {
                    Some(tcp) => {
                        self.inner.tracker.spawn(self.clone().forward_inbound(inbound.name.clone(), tcp));
                    }
                    None => break,
                },
            }
        }
    }

    async fn forward_inbound(self, name: String, tcp: TcpStream) {
        let opened = tokio::select! {
            _ = self.inner.cancel.cancelled() => return,
            opened = self.inner.conn.open_tunnel(&name) => opened,
        };
        match opened {
            Ok(channel) => splice(
                &self.inner.tracker,
                &self.inner.cancel,
                name,
                tcp,
                channel.into_stream(),
            ),
            Err(e) => tracing::warn!(error = %e, "{} phase: inbound tunnel failed", self.inner.role),
        }
    }
}
