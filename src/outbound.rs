//! Response body as written by the dispatcher.
//!
//! Writes are buffered into chunks of `chunk_size` bytes. A full chunk is framed
//! for the chosen output mode and handed to the connection without blocking.

use crate::limit::LimitWrite;
use crate::Error;
use bytes::{Bytes, BytesMut};
use futures_channel::mpsc;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// What the connection receives from an outbound entity.
#[derive(Debug)]
pub(crate) enum Frame {
    /// Framed body bytes, ready for the socket.
    Data(Bytes),
    /// Push what is buffered to the peer.
    Flush,
    /// Message is complete. `written` is the body size (not counting framing).
    End { written: u64 },
    /// The response can't be completed, tear the connection down.
    Abort,
}

pub(crate) fn channel(
    limit: LimitWrite,
    chunk_size: usize,
) -> (OutboundEntity, mpsc::UnboundedReceiver<Frame>) {
    let (tx, rx) = mpsc::unbounded();

    let outbound = Outbound {
        limit,
        chunk: BytesMut::new(),
        chunk_size: chunk_size.max(1),
        tx,
        failed: false,
        closed: false,
        bytes_written: 0,
    };

    (
        OutboundEntity(OutboundHandle(Arc::new(Mutex::new(outbound)))),
        rx,
    )
}

/// Shared handle to the outbound state, used by the exchange to close or fail the
/// entity independently of whoever owns the `OutboundEntity`.
#[derive(Clone)]
pub(crate) struct OutboundHandle(Arc<Mutex<Outbound>>);

struct Outbound {
    limit: LimitWrite,
    /// Accumulating, not yet framed, body bytes.
    chunk: BytesMut,
    chunk_size: usize,
    tx: mpsc::UnboundedSender<Frame>,
    failed: bool,
    closed: bool,
    bytes_written: u64,
}

impl OutboundHandle {
    fn lock(&self) -> MutexGuard<'_, Outbound> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mark the response as failed. Buffered data will be discarded on close.
    pub fn mark_failed(&self) {
        self.lock().failed = true;
    }

    pub fn close(&self) -> Result<(), Error> {
        self.lock().close()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }
}

impl Outbound {
    fn write(&mut self, mut data: &[u8]) -> Result<(), Error> {
        if self.closed {
            return Err(Error::User("Write on closed entity stream".into()));
        }
        if self.failed {
            return Err(Error::Aborted("Response has failed".into()));
        }

        self.limit.accept(data.len())?;

        if self.limit.is_no_body() {
            return Ok(());
        }

        while !data.is_empty() {
            let room = self.chunk_size - self.chunk.len();
            let max = room.min(data.len());

            self.chunk.extend_from_slice(&data[..max]);
            data = &data[max..];

            if self.chunk.len() >= self.chunk_size {
                self.handoff()?;
            }
        }

        Ok(())
    }

    /// Frame the current chunk and send it to the connection.
    fn handoff(&mut self) -> Result<(), Error> {
        if self.chunk.is_empty() {
            return Ok(());
        }

        let framed = self.frame_chunk();
        self.send(Frame::Data(framed.freeze()))
    }

    fn frame_chunk(&mut self) -> BytesMut {
        let data = self.chunk.split();
        self.bytes_written += data.len() as u64;

        match &self.limit {
            LimitWrite::ChunkedEncoder => {
                let mut out = BytesMut::with_capacity(data.len() + 32);
                self.limit.write(&data, &mut out);
                out
            }
            // no framing, pass the buffer on as is
            _ => data,
        }
    }

    fn send(&mut self, frame: Frame) -> Result<(), Error> {
        if self.tx.unbounded_send(frame).is_err() {
            self.failed = true;
            return Err(Error::Aborted("Connection is closed".into()));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        if self.closed || self.failed {
            return Ok(());
        }
        self.handoff()?;
        self.send(Frame::Flush)
    }

    fn close(&mut self) -> Result<(), Error> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if self.failed {
            trace!("Close failed outbound, discard {} bytes", self.chunk.len());
            self.chunk.clear();
            let _ = self.tx.unbounded_send(Frame::Abort);
            return Ok(());
        }

        let mut out = self.frame_chunk();

        if let Err(e) = self.limit.finish(&mut out) {
            debug!("Outbound incomplete: {}", e);
            self.failed = true;
            let _ = self.tx.unbounded_send(Frame::Abort);
            return Err(e);
        }

        if !out.is_empty() {
            self.send(Frame::Data(out.freeze()))?;
        }

        trace!("Close outbound, {} bytes written", self.bytes_written);

        let written = self.bytes_written;
        self.send(Frame::End { written })
    }
}

/// Response body writer handed out by `Exchange::write_status_and_headers`.
///
/// Implements `std::io::Write`. Writes never block: bytes are passed on to the
/// connection as chunks fill up. The response completes on `close()`, which also
/// happens on drop.
pub struct OutboundEntity(OutboundHandle);

impl OutboundEntity {
    pub(crate) fn handle(&self) -> OutboundHandle {
        self.0.clone()
    }

    /// Finish the response body. Calling it more than once does nothing.
    pub fn close(&mut self) -> Result<(), Error> {
        self.0.close()
    }

    pub fn is_closed(&self) -> bool {
        self.0.is_closed()
    }

    /// Body bytes handed to the connection so far.
    pub fn bytes_written(&self) -> u64 {
        self.0.lock().bytes_written
    }
}

impl io::Write for OutboundEntity {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().write(buf).map_err(Error::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().flush().map_err(Error::into_io)
    }
}

impl Drop for OutboundEntity {
    fn drop(&mut self) {
        if let Err(e) = self.0.close() {
            debug!("Close outbound entity on drop: {}", e);
        }
    }
}

impl fmt::Debug for OutboundEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0.lock();
        write!(
            f,
            "OutboundEntity {{ mode: {:?}, closed: {}, failed: {}, written: {} }}",
            o.limit, o.closed, o.failed, o.bytes_written
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use http::{StatusCode, Version};
    use std::io::Write;

    fn frames(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<String> {
        let mut out = vec![];
        while let Ok(f) = rx.try_recv() {
            out.push(match f {
                Frame::Data(b) => format!("Data({})", String::from_utf8_lossy(&b)),
                Frame::Flush => "Flush".to_string(),
                Frame::End { written } => format!("End({})", written),
                Frame::Abort => "Abort".to_string(),
            });
        }
        out
    }

    fn mode(len: Option<u64>) -> LimitWrite {
        LimitWrite::for_response(len, StatusCode::OK, Version::HTTP_11, false)
    }

    #[test]
    fn chunked_in_chunk_size_pieces() {
        let (mut out, mut rx) = channel(mode(None), 4);

        out.write_all(b"hello world").unwrap();
        assert_eq!(frames(&mut rx), vec!["Data(4\r\nhell\r\n)", "Data(4\r\no wo\r\n)"]);

        out.close().unwrap();
        assert_eq!(
            frames(&mut rx),
            vec!["Data(3\r\nrld\r\n0\r\n\r\n)", "End(11)"]
        );
        assert_eq!(out.bytes_written(), 11);
    }

    #[test]
    fn flush_sends_partial_chunk() {
        let (mut out, mut rx) = channel(mode(Some(5)), 1024);

        out.write_all(b"ab").unwrap();
        assert!(frames(&mut rx).is_empty());
        out.flush().unwrap();
        assert_eq!(frames(&mut rx), vec!["Data(ab)", "Flush"]);

        out.write_all(b"cde").unwrap();
        drop(out);
        assert_eq!(frames(&mut rx), vec!["Data(cde)", "End(5)"]);
    }

    #[test]
    fn empty_mode_rejects_writes_and_ends_once() {
        let (mut out, mut rx) = channel(mode(Some(0)), 1024);

        assert!(out.write(b"x").is_err());
        out.close().unwrap();
        out.close().unwrap();
        drop(out);

        assert_eq!(frames(&mut rx), vec!["End(0)"]);
    }

    #[test]
    fn failed_close_discards() {
        let (mut out, mut rx) = channel(mode(None), 1024);
        let handle = out.handle();

        out.write_all(b"partial").unwrap();
        handle.mark_failed();

        assert!(out.write(b"more").is_err());
        out.close().unwrap();
        handle.close().unwrap();

        assert_eq!(frames(&mut rx), vec!["Abort"]);
    }

    #[test]
    fn too_long_and_too_short() {
        let (mut out, mut rx) = channel(mode(Some(3)), 1024);
        assert!(out.write(b"abcd").is_err());
        out.write_all(b"ab").unwrap();
        assert!(out.close().is_err());
        assert_eq!(frames(&mut rx), vec!["Abort"]);
    }

    #[test]
    fn write_after_connection_gone() {
        let (mut out, rx) = channel(mode(None), 2);
        drop(rx);
        assert!(out.write_all(b"abcd").is_err());
    }
}
