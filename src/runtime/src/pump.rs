//! TCP to channel splicing.

use crate::transport::TunnelStream;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Copy bytes both ways between `tcp` and `channel` until either direction
/// ends or `cancel` fires; then both endpoints are shut down.
pub fn splice(
    tracker: &TaskTracker,
    cancel: &CancellationToken,
    name: String,
    tcp: TcpStream,
    channel: TunnelStream,
) {
    let done = cancel.child_token();
    let (tcp_read, tcp_write) = tcp.into_split();
    let (chan_read, chan_write) = tokio::io::split(channel);

    tracker.spawn(copy_half(tcp_read, chan_write, done.clone(), name.clone(), "tcp->channel"));
    tracker.spawn(copy_half(chan_read, tcp_write, done, name, "channel->tcp"));
}

async fn copy_half<R, W>(
    mut reader: R,
    mut writer: W,
    done: CancellationToken,
    name: String,
    direction: &'static str,
) where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    tokio::select! {
        result = tokio::io::copy(&mut reader, &mut writer) => match result {
            Ok(bytes) => tracing::trace!(%name, direction, bytes, "Copy finished"),
            Err(e) => tracing::debug!(%name, direction, error = %e, "Copy failed"),
        },
        _ = done.cancelled() => {}
    }
    done.cancel();
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (client.unwrap(), accepted.unwrap().0)
    }

    #[tokio::test]
    async fn test_splice_copies_both_ways() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (mut outside, inside) = tcp_pair().await;
        let (chan, mut remote) = tokio::io::duplex(1024);

        splice(&tracker, &cancel, "ABC".into(), inside, Box::new(chan));

        outside.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        remote.write_all(b"reply").await.unwrap();
        let mut buf = [0u8; 5];
        outside.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");

        // Channel EOF tears down the TCP side too.
        drop(remote);
        let mut rest = Vec::new();
        outside.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_splice() {
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();
        let (mut outside, inside) = tcp_pair().await;
        let (chan, _remote) = tokio::io::duplex(1024);

        splice(&tracker, &cancel, "ABC".into(), inside, Box::new(chan));
        cancel.cancel();
        tracker.close();
        tracker.wait().await;

        let mut rest = Vec::new();
        outside.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }
}
