use crate::AsyncWrite;
use bytes::{Buf, BytesMut};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Write as much of `to_write` as the transport accepts, then flush if asked to.
///
/// `Pending` means the socket is full (or flushing), which is fine: the caller can
/// still make progress on the reading side.
pub(crate) fn try_write<S: AsyncWrite + Unpin + ?Sized>(
    cx: &mut Context,
    io: &mut S,
    to_write: &mut BytesMut,
    to_write_flush_after: &mut bool,
) -> Poll<io::Result<()>> {
    loop {
        if to_write.is_empty() {
            if *to_write_flush_after {
                trace!("try_write attempt flush");

                match Pin::new(&mut *io).poll_flush(cx) {
                    Poll::Pending => {
                        return Poll::Pending;
                    }
                    Poll::Ready(Ok(_)) => {
                        trace!("try_write flushed");
                        *to_write_flush_after = false;
                    }
                    Poll::Ready(Err(e)) => {
                        trace!("try_write error: {:?}", e);
                        return Err(e).into();
                    }
                }
            }

            return Ok(()).into();
        }

        trace!("try_write left: {}", to_write.len());

        match Pin::new(&mut *io).poll_write(cx, &to_write[..]) {
            Poll::Pending => {
                trace!("try_write: Poll::Pending");
                return Poll::Pending;
            }

            Poll::Ready(Ok(0)) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "Transport accepted no bytes",
                ))
                .into();
            }

            Poll::Ready(Ok(amount)) => {
                trace!("try_write did write: {}", amount);
                to_write.advance(amount);
            }

            Poll::Ready(Err(e)) => {
                trace!("try_write error: {:?}", e);
                return Err(e).into();
            }
        }
    }
}
