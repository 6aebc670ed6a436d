//! Transport glue between tokio sockets and the runtime-agnostic connection.

use crate::{AsyncRead, AsyncWrite};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead as TokioAsyncRead, AsyncWrite as TokioAsyncWrite, ReadBuf};

/// Last time bytes moved in either direction on a connection.
#[derive(Debug)]
pub(crate) struct Activity {
    base: Instant,
    /// Milliseconds since `base`.
    last: AtomicU64,
}

impl Activity {
    pub fn new() -> Arc<Self> {
        Arc::new(Activity {
            base: Instant::now(),
            last: AtomicU64::new(0),
        })
    }

    pub fn touch(&self) {
        let now = self.base.elapsed().as_millis() as u64;
        self.last.store(now, Ordering::Relaxed);
    }

    pub fn last(&self) -> Instant {
        self.base + Duration::from_millis(self.last.load(Ordering::Relaxed))
    }
}

/// futures-io view of a tokio stream, recording activity.
pub(crate) struct TokioIo<Z> {
    adapted: Z,
    activity: Arc<Activity>,
}

impl<Z> TokioIo<Z>
where
    Z: TokioAsyncRead + TokioAsyncWrite + Unpin + Send + 'static,
{
    pub fn new(adapted: Z, activity: Arc<Activity>) -> Self {
        TokioIo { adapted, activity }
    }
}

impl<Z: TokioAsyncRead + Unpin> AsyncRead for TokioIo<Z> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let mut read_buf = ReadBuf::new(buf);

        match Pin::new(&mut this.adapted).poll_read(cx, &mut read_buf) {
            Poll::Ready(Ok(())) => {
                let amount = read_buf.filled().len();
                if amount > 0 {
                    this.activity.touch();
                }
                Poll::Ready(Ok(amount))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<Z: TokioAsyncWrite + Unpin> AsyncWrite for TokioIo<Z> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let ret = Pin::new(&mut this.adapted).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = &ret {
            if *n > 0 {
                this.activity.touch();
            }
        }
        ret
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().adapted).poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().adapted).poll_shutdown(cx)
    }
}
