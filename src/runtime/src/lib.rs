//! Secure Comms Runtime - SSH Tunnel Plumbing
//!
//! This crate carries named TCP services over one SSH connection between a
//! worker node and a peer-pod: the SSH transport adapter, the control
//! channel, per-connection peers, inbound listeners, outbound targets, the
//! KBS reverse proxy and network-namespace helpers.

pub mod control;
pub mod inbound;
pub mod kbs_proxy;
pub mod netns;
pub mod outbound;
pub mod peer;
pub mod pump;
pub mod transport;

// Re-export common types
pub use control::{ControlChannel, IncomingRequest};
pub use inbound::{Inbound, InboundQueue, InboundSet};
pub use outbound::{Outbound, OutboundSet};
pub use peer::Peer;
pub use transport::{
    accept, connect, ChannelKind, ChannelOffer, ClientAuth, ConnectionStreams, HostKeyCheck,
    ServerSettings, SshChannel, SshConnection, TunnelFilter, TunnelStream,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
