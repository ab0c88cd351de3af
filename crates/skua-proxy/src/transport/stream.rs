use super::connector::ConnectInfo;
use crate::policy::BandwidthLimits;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;

/// Any byte stream a connection can be layered on
pub(crate) trait Io: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Io for T {}

/// Applies the response idle timeout and the bandwidth caps to a raw stream
pub(crate) struct ShapedIo {
    inner: Box<dyn Io>,
    idle_timeout: Option<Duration>,
    idle_deadline: Option<Pin<Box<Sleep>>>,
    bandwidth: Arc<BandwidthLimits>,
    read_pause: Option<Pin<Box<Sleep>>>,
    write_pause: Option<Pin<Box<Sleep>>>,
}

impl ShapedIo {
    pub(crate) fn new(
        inner: Box<dyn Io>,
        idle_timeout: Option<Duration>,
        bandwidth: Arc<BandwidthLimits>,
    ) -> Self {
        Self {
            inner,
            idle_timeout,
            idle_deadline: None,
            bandwidth,
            read_pause: None,
            write_pause: None,
        }
    }
}

/// Time `bytes` take at `limit` bytes per second
fn pause_for(bytes: usize, limit: Option<u64>) -> Option<Pin<Box<Sleep>>> {
    let limit = limit?;
    let pause = Duration::from_secs_f64(bytes as f64 / limit as f64);
    (!pause.is_zero()).then(|| Box::pin(tokio::time::sleep(pause)))
}

fn wait_out(pause: &mut Option<Pin<Box<Sleep>>>, cx: &mut Context<'_>) -> Poll<()> {
    if let Some(sleep) = pause.as_mut() {
        ready!(sleep.as_mut().poll(cx));
        *pause = None;
    }
    Poll::Ready(())
}

impl AsyncRead for ShapedIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(wait_out(&mut this.read_pause, cx));

        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.idle_deadline = None;
                let read = buf.filled().len() - before;
                this.read_pause = pause_for(read, this.bandwidth.read_limit());
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => {
                let Some(timeout) = this.idle_timeout else {
                    return Poll::Pending;
                };
                let deadline = this
                    .idle_deadline
                    .get_or_insert_with(|| Box::pin(tokio::time::sleep(timeout)));
                if deadline.as_mut().poll(cx).is_ready() {
                    this.idle_deadline = None;
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        "Timed out waiting for the upstream response",
                    )));
                }
                Poll::Pending
            }
        }
    }
}

impl AsyncWrite for ShapedIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(wait_out(&mut this.write_pause, cx));

        let written = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        // A new request restarts the wait for its response
        this.idle_deadline = None;
        this.write_pause = pause_for(written, this.bandwidth.write_limit());
        Poll::Ready(Ok(written))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// An established upstream connection handed to the HTTP client
pub struct UpstreamStream {
    io: TokioIo<ShapedIo>,
    info: ConnectInfo,
    via_proxy: bool,
}

impl UpstreamStream {
    pub(crate) fn new(io: ShapedIo, info: ConnectInfo, via_proxy: bool) -> Self {
        Self {
            io: TokioIo::new(io),
            info,
            via_proxy,
        }
    }
}

impl Connection for UpstreamStream {
    fn connected(&self) -> Connected {
        // Plain HTTP through an upstream proxy goes out in absolute form
        Connected::new()
            .proxy(self.via_proxy)
            .extra(self.info.clone())
    }
}

impl Read for UpstreamStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_read(cx, buf)
    }
}

impl Write for UpstreamStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().io).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().io).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_idle_timeout_fires_without_data() {
        let (client, _server) = tokio::io::duplex(64);
        let mut io = ShapedIo::new(
            Box::new(client),
            Some(Duration::from_millis(30)),
            Arc::new(BandwidthLimits::default()),
        );
        let mut buf = [0u8; 8];
        let err = io.read(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_read_is_paced() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut io = ShapedIo::new(Box::new(client), None, Arc::new(BandwidthLimits::new(1000, 0)));

        server.write_all(&[7u8; 100]).await.unwrap();
        server.write_all(&[7u8; 100]).await.unwrap();
        drop(server);

        let started = Instant::now();
        let mut received = Vec::new();
        io.read_to_end(&mut received).await.unwrap();
        assert_eq!(received.len(), 200);
        // The first read is free; the pause after it is at least 100 bytes at 1000 B/s
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
