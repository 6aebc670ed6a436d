//! Blocking view of a request body that is still arriving.
//!
//! The connection (reactor side) pushes chunks through an [`InboundSender`], and the
//! dispatcher (worker side) reads them through [`InboundEntity`], which implements
//! `std::io::Read`. The chunks sit in a queue both sides can drain, so whichever
//! side closes first releases them. The channel between the two only wakes up a
//! blocked reader.

use crate::Error;
use bytes::{Buf, Bytes};
use futures_channel::oneshot;
use futures_util::task::AtomicWaker;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

enum Message {
    /// A chunk was queued.
    More,
    Last,
    Abort(String),
}

#[derive(Default)]
struct Queue {
    chunks: VecDeque<Bytes>,
    /// Bytes received but not yet read.
    readable: usize,
}

struct Shared {
    queue: Mutex<Queue>,
    /// Bytes received in total.
    total: AtomicU64,
    closed: AtomicBool,
    input_completed: AtomicBool,
    read_choked: AtomicBool,
    /// Reactor waiting for the reader to drain below the low watermark.
    resume: AtomicWaker,
    high_watermark: usize,
    low_watermark: usize,
}

impl Shared {
    fn queue(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn readable(&self) -> usize {
        self.queue().readable
    }

    /// Drop every queued chunk.
    fn clear(&self) {
        let mut queue = self.queue();
        queue.chunks.clear();
        queue.readable = 0;
    }
}

/// Create the two halves of an inbound entity stream for a request with a body.
///
/// If `continue_tx` is given, it is signalled the first time the entity is read.
pub(crate) fn channel(
    high_watermark: usize,
    low_watermark: usize,
    continue_tx: Option<oneshot::Sender<()>>,
) -> (InboundEntity, InboundSender) {
    let (tx, rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue::default()),
        total: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        input_completed: AtomicBool::new(false),
        read_choked: AtomicBool::new(false),
        resume: AtomicWaker::new(),
        high_watermark,
        low_watermark: low_watermark.min(high_watermark),
    });

    let entity = InboundEntity {
        inner: Some(Box::new(Receiving {
            rx,
            shared: shared.clone(),
            continue_tx,
            done: false,
            closed_locally: false,
        })),
    };

    let sender = InboundSender {
        inner: Some(Sending {
            tx: Some(tx),
            shared,
        }),
    };

    (entity, sender)
}

/// Both halves for a request without a body. Nothing is allocated.
pub(crate) fn empty() -> (InboundEntity, InboundSender) {
    (InboundEntity::empty(), InboundSender { inner: None })
}

/// Request body as read by the dispatcher.
///
/// `read()` blocks the calling thread until some body bytes are available, the
/// body is complete (returns 0), or the exchange is torn down (returns an error).
pub struct InboundEntity {
    /// `None` is the shared empty body.
    inner: Option<Box<Receiving>>,
}

struct Receiving {
    rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    continue_tx: Option<oneshot::Sender<()>>,
    /// Got the last chunk.
    done: bool,
    closed_locally: bool,
}

impl InboundEntity {
    /// An entity for a request without body.
    pub fn empty() -> Self {
        InboundEntity { inner: None }
    }

    /// Number of bytes that can be read without blocking.
    pub fn available(&self) -> usize {
        match &self.inner {
            None => 0,
            Some(r) if r.shared.closed.load(Ordering::SeqCst) => 0,
            Some(r) => r.shared.readable(),
        }
    }

    /// Whether all of the body has arrived from the peer.
    pub fn is_input_completed(&self) -> bool {
        match &self.inner {
            None => true,
            Some(r) => r.shared.input_completed.load(Ordering::SeqCst),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &self.inner {
            None => false,
            Some(r) => r.shared.closed.load(Ordering::SeqCst),
        }
    }

    /// Stop reading. Any buffered body data is released, and the rest of the body
    /// is discarded as it arrives. Calling it again does nothing.
    pub fn close(&mut self) {
        if let Some(r) = &mut self.inner {
            if r.closed_locally {
                return;
            }
            trace!("Close inbound entity");
            r.closed_locally = true;
            r.shared.closed.store(true, Ordering::SeqCst);
            r.release();
        }
    }
}

impl Receiving {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        if self.closed_locally {
            return Err(Error::User("Read on closed entity stream".into()));
        }

        if let Some(tx) = self.continue_tx.take() {
            trace!("First read of entity, request 100-continue");
            // The connection may already have given up on the exchange.
            let _ = tx.send(());
        }

        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.done && self.shared.queue().chunks.is_empty() {
                return Ok(0);
            }

            if self.shared.closed.load(Ordering::SeqCst) {
                self.release();
                return Err(Error::Aborted("Request entity was closed".into()));
            }

            if let Some(amount) = self.read_queued(buf) {
                return Ok(amount);
            }

            match self.rx.blocking_recv() {
                Some(Message::More) => {}
                Some(Message::Last) => {
                    self.done = true;
                }
                Some(Message::Abort(reason)) => {
                    self.release();
                    return Err(Error::Aborted(reason));
                }
                None => {
                    self.release();
                    return Err(Error::Aborted(
                        "Connection ended before the request body was complete".into(),
                    ));
                }
            }
        }
    }

    /// Copy from the front chunk, `None` if nothing is queued.
    fn read_queued(&self, buf: &mut [u8]) -> Option<usize> {
        let mut guard = self.shared.queue();
        let queue = &mut *guard;

        let front = queue.chunks.front_mut()?;
        let max = buf.len().min(front.len());
        buf[..max].copy_from_slice(&front[..max]);
        front.advance(max);
        if front.is_empty() {
            queue.chunks.pop_front();
        }

        queue.readable -= max;
        let now = queue.readable;
        drop(guard);

        if now <= self.shared.low_watermark && self.shared.read_choked.swap(false, Ordering::SeqCst)
        {
            trace!("Inbound drained to {} bytes, resume reading", now);
            self.shared.resume.wake();
        }

        Some(max)
    }

    /// Drop every chunk held and stop listening for more.
    fn release(&mut self) {
        self.rx.close();
        while self.rx.try_recv().is_ok() {}
        self.shared.clear();
        self.shared.read_choked.store(false, Ordering::SeqCst);
        self.shared.resume.wake();
    }
}

impl io::Read for InboundEntity {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            None => Ok(0),
            Some(r) => r.read(buf).map_err(Error::into_io),
        }
    }
}

impl Drop for InboundEntity {
    fn drop(&mut self) {
        self.close();
    }
}

/// Reactor side of the inbound entity.
pub(crate) struct InboundSender {
    /// `None` for the empty body.
    inner: Option<Sending>,
}

struct Sending {
    tx: Option<mpsc::UnboundedSender<Message>>,
    shared: Arc<Shared>,
}

impl InboundSender {
    /// Hand a received chunk to the reader. `is_last` marks the body complete.
    ///
    /// This never asks for more input by itself, the connection decides when
    /// to read again (see `is_choked`).
    pub fn add_buffer(&mut self, chunk: Bytes, is_last: bool) -> Result<(), Error> {
        let inner = match &mut self.inner {
            Some(v) => v,
            None => {
                if chunk.is_empty() && is_last {
                    return Ok(());
                }
                return Err(Error::User("Empty entity does not accept body data".into()));
            }
        };

        let shared = &inner.shared;

        if shared.closed.load(Ordering::SeqCst) {
            // discard mode, keep counting so the body can be drained
            if !chunk.is_empty() {
                trace!("Discard {} bytes for closed entity", chunk.len());
                shared.total.fetch_add(chunk.len() as u64, Ordering::SeqCst);
            }
            if is_last {
                shared.input_completed.store(true, Ordering::SeqCst);
                inner.tx = None;
            }
            return Ok(());
        }

        let tx = match &inner.tx {
            Some(v) => v,
            None => return Err(Error::User("Entity already received its last chunk".into())),
        };

        if !chunk.is_empty() {
            let len = chunk.len();
            shared.total.fetch_add(len as u64, Ordering::SeqCst);

            let readable = {
                let mut queue = shared.queue();
                queue.chunks.push_back(chunk);
                queue.readable += len;
                queue.readable
            };

            if tx.send(Message::More).is_err() {
                // reader went away in between
                shared.clear();
            } else if readable > shared.high_watermark
                && !shared.read_choked.swap(true, Ordering::SeqCst)
            {
                trace!("Inbound has {} unread bytes, choke reading", readable);
            }
        }

        if is_last {
            let _ = tx.send(Message::Last);
            shared.input_completed.store(true, Ordering::SeqCst);
            inner.tx = None;
        }

        Ok(())
    }

    /// Whether the reader is too far behind for us to read more body.
    pub fn is_choked(&self) -> bool {
        match &self.inner {
            None => false,
            Some(v) => v.shared.read_choked.load(Ordering::SeqCst),
        }
    }

    /// Wait until the reader has drained the entity below the low watermark.
    pub fn poll_unchoked(&self, cx: &mut Context<'_>) -> Poll<()> {
        let shared = match &self.inner {
            None => return Poll::Ready(()),
            Some(v) => &v.shared,
        };

        if !shared.read_choked.load(Ordering::SeqCst) {
            return Poll::Ready(());
        }

        shared.resume.register(cx.waker());

        // the reader might have drained after we set the choke but before registering.
        if shared.closed.load(Ordering::SeqCst) || shared.readable() <= shared.low_watermark {
            shared.read_choked.store(false, Ordering::SeqCst);
            return Poll::Ready(());
        }

        if shared.read_choked.load(Ordering::SeqCst) {
            Poll::Pending
        } else {
            Poll::Ready(())
        }
    }

    /// Total body bytes received so far.
    pub fn total(&self) -> u64 {
        match &self.inner {
            None => 0,
            Some(v) => v.shared.total.load(Ordering::SeqCst),
        }
    }

    /// Tear down from the reactor side. Queued chunks are released, a reader
    /// blocked in `read()` is woken up with an error, and further chunks are
    /// discarded.
    pub fn close(&mut self, reason: &str) {
        if let Some(inner) = &mut self.inner {
            if inner.shared.closed.swap(true, Ordering::SeqCst) && inner.tx.is_none() {
                return;
            }
            trace!("Close inbound sender: {}", reason);
            inner.shared.read_choked.store(false, Ordering::SeqCst);
            inner.shared.clear();
            if let Some(tx) = inner.tx.take() {
                let _ = tx.send(Message::Abort(reason.to_string()));
            }
        }
    }
}

impl fmt::Debug for InboundEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "InboundEntity(empty)"),
            Some(r) => write!(
                f,
                "InboundEntity {{ readable: {}, done: {}, closed: {} }}",
                r.shared.readable(),
                r.done,
                r.shared.closed.load(Ordering::SeqCst),
            ),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures_util::task::{waker, ArcWake};
    use std::io::Read;
    use std::sync::atomic::AtomicUsize;

    struct CountWake(AtomicUsize);

    impl ArcWake for CountWake {
        fn wake_by_ref(arc_self: &Arc<Self>) {
            arc_self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn read_chunks_then_eof() {
        let (mut entity, mut sender) = channel(1024, 512, None);

        sender.add_buffer(Bytes::from_static(b"hello"), false).unwrap();
        sender.add_buffer(Bytes::from_static(b" world"), true).unwrap();

        assert_eq!(entity.available(), 11);
        assert!(entity.is_input_completed());

        let mut s = String::new();
        entity.read_to_string(&mut s).unwrap();
        assert_eq!(s, "hello world");
        assert_eq!(entity.available(), 0);
        assert_eq!(sender.total(), 11);

        let mut buf = [0_u8; 4];
        assert_eq!(entity.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn blocked_reader_is_woken_by_data() {
        let (mut entity, mut sender) = channel(1024, 512, None);

        let t = std::thread::spawn(move || {
            let mut v = vec![];
            entity.read_to_end(&mut v).unwrap();
            v
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        sender.add_buffer(Bytes::from_static(b"abc"), false).unwrap();
        sender.add_buffer(Bytes::new(), true).unwrap();

        assert_eq!(t.join().unwrap(), b"abc");
    }

    #[test]
    fn choke_above_high_and_resume_at_low() {
        let (mut entity, mut sender) = channel(8, 4, None);

        let count = Arc::new(CountWake(AtomicUsize::new(0)));
        let w = waker(count.clone());
        let mut cx = Context::from_waker(&w);

        sender.add_buffer(Bytes::from_static(b"12345"), false).unwrap();
        assert!(!sender.is_choked());
        sender.add_buffer(Bytes::from_static(b"67890"), false).unwrap();
        assert!(sender.is_choked());
        assert!(sender.poll_unchoked(&mut cx).is_pending());

        let mut buf = [0_u8; 3];
        entity.read_exact(&mut buf).unwrap();
        // 7 left, still above low watermark
        assert!(sender.is_choked());
        assert_eq!(count.0.load(Ordering::SeqCst), 0);

        let mut buf = [0_u8; 4];
        entity.read_exact(&mut buf).unwrap();
        assert!(!sender.is_choked());
        assert_eq!(count.0.load(Ordering::SeqCst), 1);
        assert!(sender.poll_unchoked(&mut cx).is_ready());
    }

    #[test]
    fn continue_only_on_first_read() {
        let (tx, mut rx) = oneshot::channel();
        let (mut entity, mut sender) = channel(1024, 512, Some(tx));

        sender.add_buffer(Bytes::from_static(b"x"), true).unwrap();
        assert_eq!(rx.try_recv().unwrap(), None);

        assert_eq!(entity.available(), 1);
        assert_eq!(rx.try_recv().unwrap(), None);

        let mut buf = [0_u8; 1];
        entity.read_exact(&mut buf).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Some(()));
    }

    #[test]
    fn close_is_idempotent_and_releases() {
        let (mut entity, mut sender) = channel(1024, 512, None);

        let chunk = Bytes::from(vec![1_u8; 100]);
        sender.add_buffer(chunk.clone(), false).unwrap();
        assert!(!chunk.is_unique());

        entity.close();
        entity.close();

        assert!(chunk.is_unique());
        assert_eq!(entity.available(), 0);
        assert!(entity.is_closed());

        let mut buf = [0_u8; 1];
        assert!(entity.read(&mut buf).is_err());

        // reactor keeps delivering, the data is dropped
        let late = Bytes::from(vec![2_u8; 10]);
        sender.add_buffer(late.clone(), true).unwrap();
        assert!(late.is_unique());
        assert_eq!(entity.available(), 0);
    }

    #[test]
    fn sender_close_wakes_blocked_reader() {
        let (mut entity, mut sender) = channel(1024, 512, None);

        let t = std::thread::spawn(move || {
            let mut buf = [0_u8; 8];
            entity.read(&mut buf)
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        sender.close("connection reset");
        sender.close("again");

        let err = t.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn sender_close_releases_unread_chunks() {
        let (mut entity, mut sender) = channel(1024, 512, None);

        let first = Bytes::from(vec![1_u8; 100]);
        let second = Bytes::from(vec![2_u8; 100]);
        sender.add_buffer(first.clone(), false).unwrap();
        sender.add_buffer(second.clone(), false).unwrap();

        // partly read, the rest of the front chunk is still queued
        let mut buf = [0_u8; 10];
        entity.read_exact(&mut buf).unwrap();
        assert!(!first.is_unique());
        assert!(!second.is_unique());

        // the entity is still alive, like a suspended dispatcher holding on to it
        sender.close("connection reset");
        assert!(first.is_unique());
        assert!(second.is_unique());
        assert_eq!(entity.available(), 0);
        assert!(entity.is_closed());

        let err = entity.read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[test]
    fn sender_dropped_mid_body() {
        let (mut entity, mut sender) = channel(1024, 512, None);
        sender.add_buffer(Bytes::from_static(b"ab"), false).unwrap();
        drop(sender);

        let mut buf = [0_u8; 2];
        entity.read_exact(&mut buf).unwrap();
        assert!(entity.read(&mut buf).is_err());
    }

    #[test]
    fn empty_entity() {
        let (mut entity, mut sender) = empty();

        assert!(sender.add_buffer(Bytes::from_static(b"x"), false).is_err());
        assert!(sender.add_buffer(Bytes::new(), false).is_err());
        assert!(sender.add_buffer(Bytes::new(), true).is_ok());

        assert_eq!(entity.available(), 0);
        let mut buf = [0_u8; 4];
        assert_eq!(entity.read(&mut buf).unwrap(), 0);
        entity.close();
        entity.close();
        assert_eq!(entity.read(&mut buf).unwrap(), 0);
    }
}
