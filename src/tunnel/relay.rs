//! Bidirectional byte relay with half-close propagation
//!
//! Each direction copies until its reader hits end-of-stream, then shuts
//! down the write half of the opposite side. The other direction keeps
//! flowing until it drains on its own. A genuine I/O error on either
//! direction aborts both.

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

/// Bytes moved in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// From the first stream to the second
    pub forward: u64,
    /// From the second stream to the first
    pub backward: u64,
}

/// Copy between `a` and `b` until both directions are finished
pub async fn splice<A, B>(a: A, b: B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let (abort_tx, abort_rx) = watch::channel(false);

    let (forward, backward) = tokio::join!(
        pump(&mut a_read, &mut b_write, &abort_tx, abort_rx.clone()),
        pump(&mut b_read, &mut a_write, &abort_tx, abort_rx),
    );

    Ok(RelayStats {
        forward: forward?,
        backward: backward?,
    })
}

async fn pump<R, W>(
    reader: &mut R,
    writer: &mut W,
    abort_tx: &watch::Sender<bool>,
    mut abort_rx: watch::Receiver<bool>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let result = tokio::select! {
        copied = tokio::io::copy(reader, writer) => copied,
        _ = abort_rx.changed() => Err(io::Error::new(
            io::ErrorKind::ConnectionAborted,
            "opposite direction failed",
        )),
    };

    if result.is_err() {
        abort_tx.send_replace(true);
    }

    // Half-close: tell the peer no more data is coming this way
    let _ = writer.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, ReadBuf, duplex};
    use tokio::time::timeout;

    /// Reads fail as if the peer reset the connection; writes are swallowed
    struct ResetStream;

    impl AsyncRead for ResetStream {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "reset by peer",
            )))
        }
    }

    impl AsyncWrite for ResetStream {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_splice_both_directions() {
        let (client, relay_a) = duplex(64);
        let (relay_b, server) = duplex(64);

        let relay = tokio::spawn(splice(relay_a, relay_b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        client_write.write_all(b"ping").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut got = Vec::new();
        server_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"ping");

        server_write.write_all(b"pong!").await.unwrap();
        server_write.shutdown().await.unwrap();

        let mut back = Vec::new();
        client_read.read_to_end(&mut back).await.unwrap();
        assert_eq!(back, b"pong!");

        let stats = relay.await.unwrap().unwrap();
        assert_eq!(stats, RelayStats { forward: 4, backward: 5 });
    }

    #[tokio::test]
    async fn test_half_close_keeps_other_direction_open() {
        let (client, relay_a) = duplex(16);
        let (relay_b, server) = duplex(16);
        let relay = tokio::spawn(splice(relay_a, relay_b));

        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut server_read, mut server_write) = tokio::io::split(server);

        // Client is done sending before the server has answered
        client_write.write_all(b"request").await.unwrap();
        client_write.shutdown().await.unwrap();

        let mut req = Vec::new();
        server_read.read_to_end(&mut req).await.unwrap();
        assert_eq!(req, b"request");

        // Larger than the pipe buffers, so it must stream through
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            server_write.write_all(&payload).await.unwrap();
            server_write.shutdown().await.unwrap();
        });

        let mut resp = Vec::new();
        client_read.read_to_end(&mut resp).await.unwrap();
        writer.await.unwrap();

        assert_eq!(resp, expected);
        assert_eq!(relay.await.unwrap().unwrap().backward, 4096);
    }

    #[tokio::test]
    async fn test_read_error_aborts_both_directions() {
        let (relay_b, server) = duplex(64);
        let relay = tokio::spawn(splice(ResetStream, relay_b));

        // The server neither writes nor closes, so only the abort can end
        // the backward direction
        let (mut server_read, _server_write) = tokio::io::split(server);

        let mut got = Vec::new();
        timeout(Duration::from_secs(5), server_read.read_to_end(&mut got))
            .await
            .expect("server side was never shut down")
            .unwrap();
        assert!(got.is_empty());

        let err = timeout(Duration::from_secs(5), relay)
            .await
            .expect("relay hung after the reset")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
