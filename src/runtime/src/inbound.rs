//! Inbounds: local listeners whose connections are tunnelled to the remote
//! side.

use crate::netns::{bind_in_namespace, namespace_path};
use parking_lot::Mutex;
use securecomms_core::{parse_tags, Phase, Result};
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Accepted connections waiting for a peer.
const CONNECTION_QUEUE: usize = 64;

/// A listening inbound.
pub struct Inbound {
    pub name: String,
    pub phase: Phase,
    /// Actual bound port
    pub port: u16,
    connections: tokio::sync::Mutex<mpsc::Receiver<TcpStream>>,
    listener: CancellationToken,
}

impl Inbound {
    /// Exclusive access to the accepted-connection queue.
    pub async fn connections(&self) -> InboundQueue<'_> {
        InboundQueue {
            inbound: self,
            queue: self.connections.lock().await,
        }
    }

    /// Stop listening. Queued connections are dropped here, or by the
    /// current queue holder on its next `next`.
    fn close(&self) {
        self.listener.cancel();
        if let Ok(mut queue) = self.connections.try_lock() {
            drain(&mut queue);
        }
    }
}

/// Held access to an inbound's accepted connections.
pub struct InboundQueue<'a> {
    inbound: &'a Inbound,
    queue: tokio::sync::MutexGuard<'a, mpsc::Receiver<TcpStream>>,
}

impl InboundQueue<'_> {
    /// Next accepted connection; `None` once the inbound is closed.
    pub async fn next(&mut self) -> Option<TcpStream> {
        tokio::select! {
            biased;
            _ = self.inbound.listener.cancelled() => {}
            tcp = self.queue.recv() => return tcp,
        }
        drain(&mut self.queue);
        None
    }
}

fn drain(queue: &mut mpsc::Receiver<TcpStream>) {
    queue.close();
    while queue.try_recv().is_ok() {}
}

impl std::fmt::Debug for Inbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inbound")
            .field("name", &self.name)
            .field("phase", &self.phase)
            .field("port", &self.port)
            .finish()
    }
}

/// Ordered set of inbounds.
#[derive(Default)]
pub struct InboundSet {
    list: Mutex<Vec<Arc<Inbound>>>,
    tracker: TaskTracker,
}

impl InboundSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on `127.0.0.1:port` (inside `namespace` when non-empty) and
    /// return the actual port.
    pub async fn add(&self, namespace: &str, port: u16, name: &str, phase: Phase) -> Result<u16> {
        let ns_path = (!namespace.is_empty()).then(|| namespace_path(namespace));
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let listener = bind_in_namespace(ns_path.as_deref(), addr).await?;
        let port = listener.local_addr()?.port();

        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE);
        let cancel = CancellationToken::new();
        self.tracker
            .spawn(accept_loop(listener, tx, cancel.clone(), name.to_string()));

        tracing::info!(name, %phase, port, namespace, "Inbound listening");
        self.list.lock().push(Arc::new(Inbound {
            name: name.to_string(),
            phase,
            port,
            connections: tokio::sync::Mutex::new(rx),
            listener: cancel,
        }));
        Ok(port)
    }

    /// Add every tag; record actual ports by name in `ports` when given.
    pub async fn add_tags<S: AsRef<str>>(
        &self,
        tags: &[S],
        mut ports: Option<&mut HashMap<String, u16>>,
    ) -> Result<()> {
        for tag in parse_tags(tags)? {
            let namespace = tag.host_or_ns.as_deref().unwrap_or_default();
            let port = self.add(namespace, tag.port, &tag.name, tag.phase).await?;
            if let Some(ports) = ports.as_deref_mut() {
                ports.insert(tag.name.clone(), port);
            }
        }
        Ok(())
    }

    pub fn list(&self) -> Vec<Arc<Inbound>> {
        self.list.lock().clone()
    }

    /// Actual port of the inbound `name`.
    pub fn port(&self, name: &str) -> Option<u16> {
        self.list
            .lock()
            .iter()
            .find(|inbound| inbound.name == name)
            .map(|inbound| inbound.port)
    }

    /// Close every listener, drop queued connections and empty the set.
    pub fn del_all(&self) {
        let inbounds = std::mem::take(&mut *self.list.lock());
        for inbound in inbounds {
            inbound.close();
        }
    }

    /// Wait for every accept loop to exit. Call after `del_all`.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

async fn accept_loop(
    listener: TcpListener,
    tx: mpsc::Sender<TcpStream>,
    cancel: CancellationToken,
    name: String,
) {
    loop {
        let stream = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%name, %addr, "Inbound accepted connection");
                    stream
                }
                Err(e) => {
                    tracing::warn!(%name, error = %e, "Inbound accept failed");
                    break;
                }
            },
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(stream) => if sent.is_err() { break },
        }
    }
    tracing::debug!(%name, "Inbound listener closed");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_add_port_zero_reports_actual_port() {
        let set = InboundSet::new();
        let port = set.add("", 0, "ABC", Phase::Attestation).await.unwrap();
        assert!(port > 0);
        assert_eq!(set.port("ABC"), Some(port));

        let _client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let inbound = set.list().pop().unwrap();
        let mut queue = inbound.connections().await;
        assert!(queue.next().await.is_some());
    }

    #[tokio::test]
    async fn test_add_tags_fills_port_map() {
        let set = InboundSet::new();
        let mut ports = HashMap::new();
        set.add_tags(
            &["KUBERNETES_PHASE:KATAAGENT:0", " ", "BOTH_PHASES:KBS:0"],
            Some(&mut ports),
        )
        .await
        .unwrap();
        assert_eq!(ports.len(), 2);
        assert_eq!(ports.get("KBS").copied(), set.port("KBS"));
        assert_eq!(set.list()[0].phase, Phase::Kubernetes);
    }

    #[tokio::test]
    async fn test_bind_conflict_surfaces() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let set = InboundSet::new();
        assert!(set.add("", port, "ABC", Phase::Both).await.is_err());
    }

    #[tokio::test]
    async fn test_del_all_closes_queue() {
        let set = InboundSet::new();
        set.add("", 0, "ABC", Phase::Both).await.unwrap();
        let inbound = set.list().pop().unwrap();

        set.del_all();
        set.wait().await;
        assert!(set.list().is_empty());
        assert!(inbound.connections().await.next().await.is_none());
    }

    #[tokio::test]
    async fn test_del_all_drops_connections_queued_under_a_holder() {
        use tokio::io::AsyncReadExt;

        let set = InboundSet::new();
        let port = set.add("", 0, "ABC", Phase::Both).await.unwrap();
        let inbound = set.list().pop().unwrap();

        // A consumer holds the queue, as a serving peer does.
        let mut queue = inbound.connections().await;
        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        while queue.queue.is_empty() {
            tokio::task::yield_now().await;
        }

        set.del_all();
        assert!(queue.next().await.is_none());
        drop(queue);
        set.wait().await;

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(std::time::Duration::from_secs(5), client.read(&mut buf)).await;
        assert!(matches!(read, Ok(Ok(0)) | Ok(Err(_))), "{read:?}");
    }
}
