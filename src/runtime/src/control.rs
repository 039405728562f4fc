//! Control channel: request/reply exchange over a framed byte stream.
//!
//! Both ends may send requests. Replies are matched to requests by id; a
//! request without `want_reply` gets no reply frame.

use crate::transport::TunnelStream;
use dashmap::DashMap;
use securecomms_core::frame::{
    read_control, write_control, ControlFrame, ControlReply, ControlRequest, RequestKind,
};
use securecomms_core::{CommsError, Result};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Queue depth for inbound control requests.
const REQUEST_QUEUE: usize = 16;

type PendingReplies = Arc<DashMap<u32, oneshot::Sender<ControlReply>>>;

#[derive(Clone)]
struct ControlWriter(Arc<Mutex<WriteHalf<TunnelStream>>>);

impl ControlWriter {
    async fn send(&self, frame: ControlFrame) -> Result<()> {
        let mut w = self.0.lock().await;
        write_control(&mut *w, &frame)
            .await
            .map_err(|e| CommsError::TransportError(format!("control channel write failed: {}", e)))
    }
}

/// A request received from the remote side.
pub struct IncomingRequest {
    pub kind: RequestKind,
    pub want_reply: bool,
    pub payload: Vec<u8>,
    id: u32,
    writer: ControlWriter,
}

impl std::fmt::Debug for IncomingRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IncomingRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("want_reply", &self.want_reply)
            .finish()
    }
}

impl IncomingRequest {
    /// Answer the request. No frame is sent when no reply was asked for.
    pub async fn reply(self, ok: bool, payload: Vec<u8>) -> Result<()> {
        if !self.want_reply {
            return Ok(());
        }
        self.writer
            .send(ControlFrame::Reply(ControlReply {
                id: self.id,
                ok,
                payload,
            }))
            .await
    }
}

/// Sending half of a control channel.
pub struct ControlChannel {
    writer: ControlWriter,
    pending: PendingReplies,
    next_id: AtomicU32,
    closed: CancellationToken,
}

impl ControlChannel {
    /// Start reading frames from `stream` on `tasks`. Requests from the
    /// remote side are delivered on the returned receiver, which closes with
    /// the stream.
    pub fn spawn(stream: TunnelStream, tasks: &TaskTracker) -> (Self, mpsc::Receiver<IncomingRequest>) {
        let (reader, writer) = tokio::io::split(stream);
        let writer = ControlWriter(Arc::new(Mutex::new(writer)));
        let pending: PendingReplies = Arc::new(DashMap::new());
        let closed = CancellationToken::new();
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);

        tasks.spawn(read_loop(
            reader,
            writer.clone(),
            pending.clone(),
            tx,
            closed.clone(),
        ));

        let channel = Self {
            writer,
            pending,
            next_id: AtomicU32::new(1),
            closed,
        };
        (channel, rx)
    }

    /// Send a request and, when `want_reply` is set, wait for its reply.
    ///
    /// Returns `(ok, payload)`; without `want_reply` this is `(true, [])`
    /// once the frame is written.
    pub async fn request(
        &self,
        kind: RequestKind,
        want_reply: bool,
        payload: &[u8],
    ) -> Result<(bool, Vec<u8>)> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let reply_rx = if want_reply {
            let (tx, rx) = oneshot::channel();
            self.pending.insert(id, tx);
            Some(rx)
        } else {
            None
        };

        let frame = ControlFrame::Request(ControlRequest {
            id,
            kind: kind.as_str().to_string(),
            want_reply,
            payload: payload.to_vec(),
        });
        if let Err(e) = self.writer.send(frame).await {
            self.pending.remove(&id);
            return Err(e);
        }

        let Some(reply_rx) = reply_rx else {
            return Ok((true, Vec::new()));
        };
        tokio::select! {
            reply = reply_rx => match reply {
                Ok(reply) => Ok((reply.ok, reply.payload)),
                Err(_) => Err(CommsError::TransportError(format!(
                    "control channel closed before '{}' was answered",
                    kind.as_str()
                ))),
            },
            _ = self.closed.cancelled() => {
                self.pending.remove(&id);
                Err(CommsError::TransportError(format!(
                    "control channel closed before '{}' was answered",
                    kind.as_str()
                )))
            }
        }
    }

    /// Stop the reader; pending requests fail.
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_loop(
    mut reader: ReadHalf<TunnelStream>,
    writer: ControlWriter,
    pending: PendingReplies,
    requests: mpsc::Sender<IncomingRequest>,
    closed: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => break,
            frame = read_control(&mut reader) => frame,
        };
        match frame {
            Ok(Some(ControlFrame::Request(req))) => {
                let incoming = IncomingRequest {
                    kind: RequestKind::from(req.kind.as_str()),
                    want_reply: req.want_reply,
                    payload: req.payload,
                    id: req.id,
                    writer: writer.clone(),
                };
                if requests.send(incoming).await.is_err() {
                    break;
                }
            }
            Ok(Some(ControlFrame::Reply(reply))) => match pending.remove(&reply.id) {
                Some((_, tx)) => {
                    let _ = tx.send(reply);
                }
                None => tracing::warn!(id = reply.id, "Reply for unknown control request"),
            },
            Ok(None) => {
                tracing::debug!("Control channel reached EOF");
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Control channel read failed");
                break;
            }
        }
    }
    closed.cancel();
    pending.clear();
}
