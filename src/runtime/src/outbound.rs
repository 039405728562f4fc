//! Outbounds: local services reached through tunnels opened by the remote
//! side.

use crate::pump::splice;
use crate::transport::SshChannel;
use securecomms_core::{parse_tags, Phase, Result};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A dial target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub name: String,
    pub phase: Phase,
    /// `host:port`
    pub addr: String,
}

/// Ordered set of outbounds.
#[derive(Debug, Clone, Default)]
pub struct OutboundSet {
    list: Vec<Arc<Outbound>>,
}

impl OutboundSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target. An empty host means loopback. No I/O happens here.
    pub fn add(&mut self, port: u16, host: &str, name: &str, phase: Phase) {
        let host = if host.is_empty() { "127.0.0.1" } else { host };
        self.list.push(Arc::new(Outbound {
            name: name.to_string(),
            phase,
            addr: format!("{}:{}", host, port),
        }));
    }

    pub fn add_tags<S: AsRef<str>>(&mut self, tags: &[S]) -> Result<()> {
        for tag in parse_tags(tags)? {
            let host = tag.host_or_ns.as_deref().unwrap_or_default();
            self.add(tag.port, host, &tag.name, tag.phase);
        }
        Ok(())
    }

    pub fn list(&self) -> &[Arc<Outbound>] {
        &self.list
    }
}

/// Dial the outbound and splice it with an accepted tunnel channel. A
/// failed dial closes the channel.
pub async fn accept_raw(
    outbound: &Outbound,
    channel: SshChannel,
    tracker: &TaskTracker,
    cancel: &CancellationToken,
) {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => {
            channel.reject().await;
            return;
        }
        dialed = TcpStream::connect(&outbound.addr) => dialed,
    };
    match dialed {
        Ok(tcp) => splice(
            tracker,
            cancel,
            outbound.name.clone(),
            tcp,
            channel.into_stream(),
        ),
        Err(e) => {
            tracing::warn!(name = %outbound.name, addr = %outbound.addr, error = %e, "Outbound dial failed");
            channel.reject().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_defaults_host() {
        let mut set = OutboundSet::new();
        set.add(7020, "", "ABC", Phase::Attestation);
        set.add(9004, "10.0.0.1", "KBS", Phase::Both);
        assert_eq!(set.list()[0].addr, "127.0.0.1:7020");
        assert_eq!(set.list()[1].addr, "10.0.0.1:9004");
    }

    #[test]
    fn test_add_tags() {
        let mut set = OutboundSet::new();
        set.add_tags(&[
            "BOTH_PHASES:KBS:9004",
            "",
            "KUBERNETES_PHASE:KUBEAPI:127.0.0.2:26443",
        ])
        .unwrap();
        assert_eq!(set.list().len(), 2);
        assert_eq!(set.list()[1].name, "KUBEAPI");
        assert_eq!(set.list()[1].phase, Phase::Kubernetes);
        assert_eq!(set.list()[1].addr, "127.0.0.2:26443");
    }

    #[test]
    fn test_add_tags_rejects_bad_batch() {
        let mut set = OutboundSet::new();
        assert!(set.add_tags(&["BOTH_PHASES:KBS:9004", "BAD_PHASE:X:1"]).is_err());
    }
}
