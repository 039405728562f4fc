//! SSH transport adapter.
//!
//! Wraps russh client and server sessions into one [`SshConnection`] shape:
//! a control channel for `Phase`/`Upgrade` requests, tunnel channels opened
//! by outbound name, and a stream of channel offers from the remote side.
//!
//! Tunnel channels are standard port-forwarding channels carrying the
//! outbound name as the address: `direct-tcpip` from the worker node
//! (client) and `forwarded-tcpip` from the peer-pod (server). The first
//! `session` channel the client opens after authentication is the control
//! channel; any other channel is surfaced as [`ChannelKind::Other`] or
//! refused.
//!
//! Once the local peer publishes its outbounds through the connection's
//! [`TunnelFilter`], tunnels to other names are refused at open time.

use crate::control::{ControlChannel, IncomingRequest};
use async_trait::async_trait;
use parking_lot::RwLock;
use russh::server::{Auth, Msg as ServerMsg, Session as ServerSession};
use russh::{client, server, Channel, MethodSet, Preferred};
use russh_keys::key::{self, KeyPair, PublicKey};
use securecomms_core::frame::RequestKind;
use securecomms_core::keys::{fingerprint, marshal_public_key};
use securecomms_core::{CommsError, Result};
use std::collections::HashSet;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::task::TaskTracker;

/// SSH user name presented by the worker node.
pub const SSH_USER: &str = "peerpod";

/// Host key algorithms accepted on both sides (no SHA-1).
static HOST_KEY_ALGORITHMS: &[key::Name] = &[key::RSA_SHA2_256, key::RSA_SHA2_512];

/// Queue depth for channel offers waiting on a peer.
const OFFER_QUEUE: usize = 64;

/// Byte stream of an accepted or opened channel.
pub trait TunnelIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelIo for T {}

pub type TunnelStream = Box<dyn TunnelIo>;

/// Kind of a channel offered by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelKind {
    /// Tunnel to the named outbound
    Tunnel(String),
    /// Anything else; always rejected
    Other(String),
}

/// A channel of either session side.
pub enum SshChannel {
    Client(Channel<client::Msg>),
    Server(Channel<ServerMsg>),
}

impl SshChannel {
    pub fn into_stream(self) -> TunnelStream {
        match self {
            SshChannel::Client(channel) => Box::new(channel.into_stream()),
            SshChannel::Server(channel) => Box::new(channel.into_stream()),
        }
    }

    /// Close the channel before any data is exchanged.
    pub async fn reject(self) {
        let result = match &self {
            SshChannel::Client(channel) => channel.close().await,
            SshChannel::Server(channel) => channel.close().await,
        };
        if let Err(e) = result {
            tracing::debug!(error = %e, "Closing rejected channel failed");
        }
    }
}

/// A channel offered by the remote side, not yet routed.
pub struct ChannelOffer {
    pub kind: ChannelKind,
    pub channel: SshChannel,
}

/// Event streams of a connection, consumed by its peer.
pub struct ConnectionStreams {
    pub channels: mpsc::Receiver<ChannelOffer>,
    pub requests: mpsc::Receiver<IncomingRequest>,
}

/// Outbound names the local peer accepts tunnels for.
///
/// Unset until the peer is ready; until then every tunnel offer is queued
/// for the peer to judge.
#[derive(Clone, Default)]
pub struct TunnelFilter(Arc<RwLock<Option<HashSet<String>>>>);

impl TunnelFilter {
    pub fn publish<I: IntoIterator<Item = String>>(&self, names: I) {
        *self.0.write() = Some(names.into_iter().collect());
    }

    /// `None` while nothing is published.
    pub fn admits(&self, name: &str) -> Option<bool> {
        self.0.read().as_ref().map(|names| names.contains(name))
    }
}

enum SessionHandle {
    Client(client::Handle<ClientHandler>),
    Server(server::Handle),
}

/// An authenticated SSH connection with its control channel open.
pub struct SshConnection {
    session: SessionHandle,
    control: ControlChannel,
    socket: std::net::TcpStream,
    remote: SocketAddr,
    tunnels: TunnelFilter,
    /// Control reader and, on the server side, the session itself
    tasks: TaskTracker,
}

impl SshConnection {
    pub fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    pub fn tunnel_filter(&self) -> &TunnelFilter {
        &self.tunnels
    }

    /// Open a tunnel channel to the remote outbound `name`.
    pub async fn open_tunnel(&self, name: &str) -> Result<SshChannel> {
        let opened = match &self.session {
            SessionHandle::Client(handle) => handle
                .channel_open_direct_tcpip(name, 0, "127.0.0.1", 0)
                .await
                .map(SshChannel::Client),
            SessionHandle::Server(handle) => handle
                .channel_open_forwarded_tcpip(name, 0, "127.0.0.1", 0)
                .await
                .map(SshChannel::Server),
        };
        opened.map_err(|e| {
            CommsError::TransportError(format!("failed to open tunnel channel '{}': {}", name, e))
        })
    }

    /// Send a control request over the control channel.
    pub async fn request(
        &self,
        kind: RequestKind,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<(bool, Vec<u8>)> {
        self.control.request(kind, want_reply, payload).await
    }

    /// Tear the connection down. Every pending read on either side ends.
    pub fn close(&self) {
        self.control.close();
        self.tasks.close();
        if let Err(e) = self.socket.shutdown(Shutdown::Both) {
            if e.kind() != std::io::ErrorKind::NotConnected {
                tracing::debug!(error = %e, remote = %self.remote, "Socket shutdown failed");
            }
        }
    }

    /// Wait for the connection's own tasks to exit. Call after `close`.
    pub async fn wait(&self) {
        self.tasks.wait().await
    }
}

/// Split a socket into the stream handed to russh and a handle able to
/// shut it down later.
fn detach_socket(stream: TcpStream) -> Result<(TcpStream, std::net::TcpStream, SocketAddr)> {
    let remote = stream.peer_addr()?;
    let std_stream = stream.into_std()?;
    let shutdown = std_stream.try_clone()?;
    Ok((TcpStream::from_std(std_stream)?, shutdown, remote))
}

// ============================================================================
// Client (worker node)
// ============================================================================

/// Server host-key policy of the client.
#[derive(Debug, Clone)]
pub enum HostKeyCheck {
    /// Accept any host key (attestation phase)
    Skip,
    /// Require the SSH wire encoding to match
    Pinned(Vec<u8>),
}

pub struct ClientHandler {
    host_key: HostKeyCheck,
    offers: mpsc::Sender<ChannelOffer>,
    tunnels: TunnelFilter,
}

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match &self.host_key {
            HostKeyCheck::Skip => {
                tracing::info!("skipped validating server's host key");
                Ok(true)
            }
            HostKeyCheck::Pinned(expected) => {
                let matches = marshal_public_key(server_public_key) == *expected;
                if !matches {
                    tracing::warn!(
                        fingerprint = %fingerprint(server_public_key),
                        "Server host key does not match the pinned key"
                    );
                }
                Ok(matches)
            }
        }
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        _connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        // The client session has already confirmed the channel here.
        if self.tunnels.admits(connected_address) == Some(false) {
            tracing::info!(name = connected_address, reason = "UnknownChannelType", "Rejected tunnel");
            session.close(channel.id());
            return Ok(());
        }
        let offer = ChannelOffer {
            kind: ChannelKind::Tunnel(connected_address.to_string()),
            channel: SshChannel::Client(channel),
        };
        if self.offers.send(offer).await.is_err() {
            tracing::debug!(name = connected_address, "Dropping channel offer, peer is gone");
        }
        Ok(())
    }
}

fn client_config() -> client::Config {
    client::Config {
        preferred: Preferred {
            key: HOST_KEY_ALGORITHMS.into(),
            ..Default::default()
        },
        inactivity_timeout: None,
        ..Default::default()
    }
}

/// Run the client handshake on `stream`, authenticate with `user_key` and
/// open the control channel.
pub async fn connect(
    stream: TcpStream,
    host_key: HostKeyCheck,
    user_key: Arc<KeyPair>,
) -> Result<(SshConnection, ConnectionStreams)> {
    let (stream, socket, remote) = detach_socket(stream)?;
    let (offers_tx, offers_rx) = mpsc::channel(OFFER_QUEUE);
    let tunnels = TunnelFilter::default();
    let handler = ClientHandler {
        host_key,
        offers: offers_tx,
        tunnels: tunnels.clone(),
    };

    let mut handle = client::connect_stream(Arc::new(client_config()), stream, handler)
        .await
        .map_err(|e| CommsError::HandshakeError(format!("SSH handshake with {} failed: {}", remote, e)))?;

    let authenticated = handle
        .authenticate_publickey(SSH_USER, user_key)
        .await
        .map_err(|e| CommsError::HandshakeError(format!("SSH authentication with {} failed: {}", remote, e)))?;
    if !authenticated {
        let _ = socket.shutdown(Shutdown::Both);
        return Err(CommsError::HandshakeError(format!(
            "{} rejected the client key",
            remote
        )));
    }

    let control = handle.channel_open_session().await.map_err(|e| {
        CommsError::HandshakeError(format!("failed to open control channel to {}: {}", remote, e))
    })?;
    let tasks = TaskTracker::new();
    let (control, requests) =
        ControlChannel::spawn(SshChannel::Client(control).into_stream(), &tasks);

    let conn = SshConnection {
        session: SessionHandle::Client(handle),
        control,
        socket,
        remote,
        tunnels,
        tasks,
    };
    let streams = ConnectionStreams {
        channels: offers_rx,
        requests,
    };
    Ok((conn, streams))
}

// ============================================================================
// Server (peer-pod)
// ============================================================================

/// Client authentication policy of the server.
#[derive(Debug, Clone)]
pub enum ClientAuth {
    /// Any client key is accepted
    Any,
    /// Only the key with this SSH wire encoding is accepted
    PublicKey(Vec<u8>),
}

/// Server settings for one phase.
#[derive(Clone)]
pub struct ServerSettings {
    config: Arc<server::Config>,
    auth: ClientAuth,
}

impl ServerSettings {
    pub fn new(host_key: KeyPair, auth: ClientAuth) -> Self {
        let config = server::Config {
            keys: vec![host_key],
            methods: MethodSet::PUBLICKEY,
            preferred: Preferred {
                key: HOST_KEY_ALGORITHMS.into(),
                ..Default::default()
            },
            auth_rejection_time: Duration::from_secs(1),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        };
        Self {
            config: Arc::new(config),
            auth,
        }
    }

    pub fn client_auth(&self) -> &ClientAuth {
        &self.auth
    }
}

struct ServerHandler {
    auth: ClientAuth,
    offers: mpsc::Sender<ChannelOffer>,
    tunnels: TunnelFilter,
    control: Option<oneshot::Sender<Channel<ServerMsg>>>,
    remote: SocketAddr,
}

#[async_trait]
impl server::Handler for ServerHandler {
    type Error = russh::Error;

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> std::result::Result<Auth, Self::Error> {
        let accepted = match &self.auth {
            ClientAuth::Any => true,
            ClientAuth::PublicKey(expected) => marshal_public_key(public_key) == *expected,
        };
        if accepted {
            tracing::info!(
                user,
                remote = %self.remote,
                fingerprint = %fingerprint(public_key),
                "Accepted client key"
            );
            Ok(Auth::Accept)
        } else {
            tracing::warn!(user, remote = %self.remote, "Rejected client key");
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<ServerMsg>,
        _session: &mut ServerSession,
    ) -> std::result::Result<bool, Self::Error> {
        match self.control.take() {
            Some(tx) => Ok(tx.send(channel).is_ok()),
            None => {
                tracing::info!(remote = %self.remote, reason = "UnknownChannelType", "Rejected session channel");
                Ok(false)
            }
        }
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<ServerMsg>,
        host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut ServerSession,
    ) -> std::result::Result<bool, Self::Error> {
        if self.tunnels.admits(host_to_connect) == Some(false) {
            tracing::info!(
                name = host_to_connect,
                remote = %self.remote,
                reason = "UnknownChannelType",
                "Refused tunnel"
            );
            return Ok(false);
        }
        let offer = ChannelOffer {
            kind: ChannelKind::Tunnel(host_to_connect.to_string()),
            channel: SshChannel::Server(channel),
        };
        Ok(self.offers.send(offer).await.is_ok())
    }
}

/// Run the server handshake on an accepted `stream` and wait for the client
/// to open the control channel.
pub async fn accept(
    stream: TcpStream,
    settings: &ServerSettings,
) -> Result<(SshConnection, ConnectionStreams)> {
    let (stream, socket, remote) = detach_socket(stream)?;
    let (offers_tx, offers_rx) = mpsc::channel(OFFER_QUEUE);
    let (control_tx, control_rx) = oneshot::channel();
    let tunnels = TunnelFilter::default();
    let handler = ServerHandler {
        auth: settings.auth.clone(),
        offers: offers_tx,
        tunnels: tunnels.clone(),
        control: Some(control_tx),
        remote,
    };

    let running = server::run_stream(settings.config.clone(), stream, handler)
        .await
        .map_err(|e| CommsError::HandshakeError(format!("SSH handshake with {} failed: {}", remote, e)))?;
    let handle = running.handle();
    let tasks = TaskTracker::new();
    tasks.spawn(async move {
        if let Err(e) = running.await {
            tracing::debug!(%remote, error = %e, "SSH session ended");
        }
    });

    let control = control_rx.await.map_err(|_| {
        CommsError::HandshakeError(format!(
            "session with {} ended before the control channel opened",
            remote
        ))
    })?;
    let (control, requests) =
        ControlChannel::spawn(SshChannel::Server(control).into_stream(), &tasks);

    let conn = SshConnection {
        session: SessionHandle::Server(handle),
        control,
        socket,
        remote,
        tunnels,
        tasks,
    };
    let streams = ConnectionStreams {
        channels: offers_rx,
        requests,
    };
    Ok((conn, streams))
}
