//! Server side state machine of one HTTP/1.1 connection.
//!
//! The connection is a future driven on an I/O thread. It alternates between
//! writing out whatever is queued in `to_write` and advancing the state:
//!
//! * `Waiting` pulls the next request head through the flow control gate.
//! * `Exchange` feeds the request body to the dispatcher (reading from the
//!   socket only while the dispatcher keeps up) and at the same time writes the
//!   response as it becomes available.
//! * `Closed` flushes what is left and shuts the transport down.
//!
//! Only one exchange is in flight at a time. Pipelined requests wait, still
//! encoded, in the read buffer until the current exchange is complete, so
//! responses always go out in request order.

use crate::codec::{Decoder, Event};
use crate::config::ServerConfig;
use crate::exchange::{self, run_dispatcher, ConnectionId, Dispatcher, Exchange};
use crate::exchange::{RequestContext, RequestId, ResponseHead, WeakExchange};
use crate::gate::Gate;
use crate::http11::{write_continue, write_http1x_res};
use crate::inbound::{self, InboundSender};
use crate::limit::{allow_reuse, expects_continue, BodyKind};
use crate::metrics::Metrics;
use crate::outbound::Frame;
use crate::pipeline::assign_request_id;
use crate::try_write::try_write;
use crate::Error;
use crate::{AsyncRead, AsyncWrite};
use bytes::{Bytes, BytesMut};
use futures_channel::{mpsc, oneshot};
use futures_util::ready;
use futures_util::stream::Stream;
use http::StatusCode;
use std::fmt;
use std::future::Future;
use std::io;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::runtime::Handle;

/// Most bytes taken from the socket in one read.
const READ_BUF_SIZE: usize = 16_384;

/// Everything connections of one server have in common.
pub(crate) struct Shared {
    pub config: ServerConfig,
    pub dispatcher: Arc<dyn Dispatcher>,
    pub metrics: Arc<dyn Metrics>,
    /// I/O runtime, also running timeouts.
    pub reactor: Handle,
    /// Runtime whose blocking pool runs dispatcher calls.
    pub workers: Handle,
    next_connection: AtomicU64,
}

impl Shared {
    pub fn new(
        config: ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<dyn Metrics>,
        reactor: Handle,
        workers: Handle,
    ) -> Self {
        Shared {
            config,
            dispatcher,
            metrics,
            reactor,
            workers,
            next_connection: AtomicU64::new(1),
        }
    }

    pub fn next_connection_id(&self) -> ConnectionId {
        ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed))
    }

    fn dispatch(self: &Arc<Self>, ctx: RequestContext) {
        let shared = self.clone();
        self.workers
            .spawn_blocking(move || run_dispatcher(&*shared.dispatcher, ctx));
    }
}

/// Drive a connection over `io` until it closes.
pub(crate) fn serve<S>(io: S, conn_id: ConnectionId, shared: Arc<Shared>) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Connection(Codec::new(io, conn_id, shared))
}

/// Future of one server connection. Resolves when the connection is done.
pub(crate) struct Connection(Codec);

impl Future for Connection {
    type Output = Result<(), Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().0.poll_drive(cx)
    }
}

struct Codec {
    io: Box<dyn Io>,
    conn_id: ConnectionId,
    shared: Arc<Shared>,
    source: Source,
    state: State,
    out: Output,
}

/// Bytes waiting for the socket.
struct Output {
    to_write: BytesMut,
    flush_after: bool,
}

enum State {
    /// Waiting for the next request.
    Waiting,
    /// Exchanging a request body and a response.
    Exchange(Box<Pending>),
    /// No more requests on this connection.
    Closed,
}

#[derive(Debug)]
enum DriveResult {
    /// Loop the drive_state again.
    Loop,
    /// Connection is done.
    Close,
}

impl Codec {
    fn new<S>(io: S, conn_id: ConnectionId, shared: Arc<Shared>) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let read_buf = if shared.config.direct_buffers {
            BytesMut::with_capacity(READ_BUF_SIZE)
        } else {
            BytesMut::new()
        };

        Codec {
            io: Box::new(IoAdapt(io)),
            conn_id,
            source: Source {
                gate: Gate::new(),
                decoder: Decoder::new(shared.config.max_header_size),
                read_buf,
                eof: false,
            },
            shared,
            state: State::Waiting,
            out: Output {
                to_write: BytesMut::new(),
                flush_after: false,
            },
        }
    }

    fn poll_drive(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
        loop {
            // Pending is fine, we can still make progress on the reading side.
            let w = try_write(
                cx,
                &mut *self.io,
                &mut self.out.to_write,
                &mut self.out.flush_after,
            );
            if let Poll::Ready(Err(e)) = w {
                let e = Error::Io(e);
                self.fail(&e);
                return Poll::Ready(Err(e));
            }

            match self.drive_state(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(DriveResult::Loop)) => continue,
                Poll::Ready(Ok(DriveResult::Close)) => return Poll::Ready(Ok(())),
                Poll::Ready(Err(e)) => {
                    self.fail(&e);
                    return Poll::Ready(Err(e));
                }
            }
        }
    }

    fn drive_state(&mut self, cx: &mut Context<'_>) -> Poll<Result<DriveResult, Error>> {
        trace!("drive_state {}: {:?}", self.conn_id, self.state);

        match &mut self.state {
            State::Waiting => {
                let event = match ready!(self.source.poll_event(cx, &mut *self.io))? {
                    Some(v) => v,
                    None => {
                        debug!("{} closed by peer", self.conn_id);
                        self.state = State::Closed;
                        return Ok(DriveResult::Loop).into();
                    }
                };

                match event {
                    Event::Head(req, kind) => {
                        let pending = Pending::begin(&self.shared, self.conn_id, req, kind);
                        self.state = State::Exchange(Box::new(pending));
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "Unexpected {:?} between requests",
                            other
                        )))
                        .into();
                    }
                }
            }

            State::Exchange(p) => {
                let step = ready!(p.drive(
                    cx,
                    &mut self.source,
                    &mut *self.io,
                    &mut self.out,
                    &self.shared
                ))?;

                if let Step::Done { reuse } = step {
                    trace!("{} is reusable: {}", self.conn_id, reuse);
                    self.state = if reuse {
                        State::Waiting
                    } else {
                        State::Closed
                    };
                }
            }

            State::Closed => {
                // try_write has registered for wakeup if something is left.
                if !self.out.to_write.is_empty() || self.out.flush_after {
                    return Poll::Pending;
                }

                if let Err(e) = ready!(Pin::new(&mut *self.io).poll_close(cx)) {
                    debug!("{} close: {}", self.conn_id, e);
                }

                return Ok(DriveResult::Close).into();
            }
        }

        Ok(DriveResult::Loop).into()
    }

    /// Give up on the connection. Nothing more is written, and the exchange in
    /// flight, if any, is torn down.
    fn fail(&mut self, err: &Error) {
        self.out.to_write.clear();
        self.out.flush_after = false;

        if let State::Exchange(mut p) = mem::replace(&mut self.state, State::Closed) {
            p.abort(&err.to_string());
        }
    }
}

impl Drop for Codec {
    fn drop(&mut self) {
        if let State::Exchange(mut p) = mem::replace(&mut self.state, State::Closed) {
            p.abort("Connection closed");
        }
    }
}

/// Reading side: socket bytes, decoded and gated into single events.
struct Source {
    gate: Gate<Result<Event, Error>>,
    decoder: Decoder,
    read_buf: BytesMut,
    eof: bool,
}

impl Source {
    /// Next event, reading the socket only when nothing is queued.
    ///
    /// `None` is a clean end of input between requests.
    fn poll_event(
        &mut self,
        cx: &mut Context<'_>,
        io: &mut dyn Io,
    ) -> Poll<Result<Option<Event>, Error>> {
        loop {
            if let Some(ev) = self.gate.request() {
                return Poll::Ready(ev.map(Some));
            }

            if self.eof {
                if self.decoder.is_idle() && self.read_buf.is_empty() {
                    return Poll::Ready(Ok(None));
                }
                return Poll::Ready(Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "Connection ended in the middle of a request",
                ))));
            }

            debug_assert!(self.gate.wants_read());
            ready!(self.poll_fill(cx, io))?;

            self.gate.begin_burst();
            self.decode_burst();
            trace!("Burst decoded, {} queued", self.gate.queued());
            if let Some(ev) = self.gate.complete_burst() {
                return Poll::Ready(ev.map(Some));
            }
        }
    }

    fn poll_fill(&mut self, cx: &mut Context<'_>, io: &mut dyn Io) -> Poll<Result<(), Error>> {
        let len = self.read_buf.len();
        self.read_buf.resize(len + READ_BUF_SIZE, 0);

        let ret = Pin::new(&mut *io).poll_read(cx, &mut self.read_buf[len..]);

        let amount = match ret {
            Poll::Ready(Ok(v)) => v,
            Poll::Ready(Err(e)) => {
                self.read_buf.truncate(len);
                return Poll::Ready(Err(e.into()));
            }
            Poll::Pending => {
                self.read_buf.truncate(len);
                return Poll::Pending;
            }
        };

        self.read_buf.truncate(len + amount);

        if amount == 0 {
            trace!("Read EOF");
            self.eof = true;
        } else {
            trace!("Read {} bytes", amount);
        }

        Poll::Ready(Ok(()))
    }

    /// Decode everything the buffer holds into the gate.
    fn decode_burst(&mut self) {
        loop {
            match self.decoder.decode(&mut self.read_buf) {
                Ok(Some(mut ev)) => {
                    if let Event::Head(req, _) = &mut ev {
                        assign_request_id(req);
                    }
                    self.gate.offer(Ok(ev));
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Decode failed: {}", e);
                    self.gate.offer(Err(e));
                    break;
                }
            }
        }
    }
}

/// Progress of an exchange.
enum Step {
    Progress,
    Done { reuse: bool },
}

/// The request/response exchange in flight.
struct Pending {
    request_id: RequestId,
    version: http::Version,
    started: Instant,
    keep_alive: bool,
    exchange: WeakExchange,
    /// Until handed to the dispatcher.
    ctx: Option<RequestContext>,
    sender: InboundSender,
    body_started: bool,
    body_done: bool,
    discarding: bool,
    continue_rx: Option<oneshot::Receiver<()>>,
    expect_continue: bool,
    continue_sent: bool,
    rx_res: Option<oneshot::Receiver<ResponseHead>>,
    rx_body: Option<mpsc::UnboundedReceiver<Frame>>,
    response_started: bool,
    response_done: bool,
    close_after: bool,
}

impl Pending {
    fn begin(
        shared: &Arc<Shared>,
        conn_id: ConnectionId,
        req: http::Request<()>,
        kind: BodyKind,
    ) -> Self {
        let (mut parts, _) = req.into_parts();

        parts.extensions.insert(conn_id);

        let request_id = parts
            .extensions
            .get::<RequestId>()
            .cloned()
            .unwrap_or_else(RequestId::generate);

        let keep_alive = allow_reuse(&parts.headers, parts.version);
        let expect_continue =
            kind != BodyKind::Empty && expects_continue(&parts.headers, parts.version);

        debug!(
            "{} {} {} {:?} request {}",
            conn_id, parts.method, parts.uri, kind, request_id
        );

        let (continue_tx, continue_rx) = if expect_continue {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };

        let (entity, sender) = if kind == BodyKind::Empty {
            inbound::empty()
        } else {
            inbound::channel(
                shared.config.high_watermark,
                shared.config.low_watermark,
                continue_tx,
            )
        };

        let (tx_res, rx_res) = oneshot::channel();

        let exchange = Exchange::new(
            shared.clone(),
            &parts,
            request_id.clone(),
            keep_alive,
            tx_res,
        );

        let mut pending = Pending {
            request_id,
            version: parts.version,
            started: Instant::now(),
            keep_alive,
            exchange: exchange.downgrade(),
            ctx: Some(RequestContext::new(parts, entity, exchange)),
            sender,
            body_started: false,
            body_done: false,
            discarding: false,
            continue_rx,
            expect_continue,
            continue_sent: false,
            rx_res: Some(rx_res),
            rx_body: None,
            response_started: false,
            response_done: false,
            close_after: false,
        };

        // The peer holds back the body until it sees 100-continue, and that is
        // only sent when the dispatcher reads. Other requests with a body are
        // dispatched when the body starts arriving.
        if kind == BodyKind::Empty || expect_continue {
            pending.dispatch(shared);
        }

        pending
    }

    fn dispatch(&mut self, shared: &Arc<Shared>) {
        if let Some(ctx) = self.ctx.take() {
            shared.dispatch(ctx);
        }
    }

    fn drive(
        &mut self,
        cx: &mut Context<'_>,
        source: &mut Source,
        io: &mut dyn Io,
        out: &mut Output,
        shared: &Arc<Shared>,
    ) -> Poll<Result<Step, Error>> {
        let mut progress = false;

        if let Some(rx) = &mut self.continue_rx {
            match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(())) => {
                    self.continue_rx = None;
                    // pointless once the peer is sending anyway or got its answer
                    if !self.response_started && !self.body_started {
                        trace!("Send 100-continue for request {}", self.request_id);
                        write_continue(self.version, &mut out.to_write);
                        out.flush_after = true;
                        self.continue_sent = true;
                        progress = true;
                    }
                }
                // entity dropped without being read
                Poll::Ready(Err(_)) => self.continue_rx = None,
                Poll::Pending => {}
            }
        }

        if !self.response_started {
            if let Some(rx) = &mut self.rx_res {
                match Pin::new(rx).poll(cx) {
                    Poll::Ready(Ok(head)) => {
                        self.start_response(head, out, shared)?;
                        progress = true;
                    }
                    Poll::Ready(Err(_)) => {
                        warn!(
                            "Exchange of request {} dropped without a response",
                            self.request_id
                        );
                        shared.metrics.failed();
                        let head = exchange::error_head(
                            &self.request_id,
                            self.version,
                            StatusCode::INTERNAL_SERVER_ERROR,
                        );
                        self.start_response(head, out, shared)?;
                        progress = true;
                    }
                    Poll::Pending => {}
                }
            }
        }

        if self.response_started && !self.response_done {
            progress |= self.pull_response_body(cx, out, shared)?;
        }

        if self.response_done && !self.body_done && !self.discarding {
            if self.expect_continue && !self.continue_sent && !self.body_started {
                // The peer is waiting for 100-continue that never comes. We can't
                // know if it will send the body, so the connection can't be reused.
                trace!("Request {} body never requested", self.request_id);
                self.sender.close("Response sent without reading the request body");
                self.close_after = true;
                self.body_done = true;
            } else if !self.keep_alive || self.close_after {
                // no next request to get in sync for
                trace!("Request {} answered, connection closes", self.request_id);
                self.sender.close("Response complete, connection closes");
                self.body_done = true;
            } else {
                trace!("Request {} answered, discard rest of body", self.request_id);
                self.sender.close("Response complete, request body discarded");
                self.discarding = true;
            }
            progress = true;
        }

        while !self.body_done {
            if self.sender.is_choked() && self.sender.poll_unchoked(cx).is_pending() {
                trace!("Request {} body choked", self.request_id);
                break;
            }

            let event = match source.poll_event(cx, io)? {
                Poll::Ready(Some(v)) => v,
                Poll::Ready(None) => {
                    return Poll::Ready(Err(Error::Protocol(
                        "End of input inside a request".into(),
                    )))
                }
                Poll::Pending => break,
            };

            progress = true;

            match event {
                Event::Data(chunk) => {
                    self.body_started = true;
                    self.sender.add_buffer(chunk, false)?;
                    self.dispatch(shared);
                }
                Event::End => {
                    self.sender.add_buffer(Bytes::new(), true)?;
                    self.body_done = true;
                    shared.metrics.request_entity_size(self.sender.total());
                    self.dispatch(shared);
                }
                Event::Head(..) => {
                    return Poll::Ready(Err(Error::Protocol(
                        "Request head inside a request body".into(),
                    )));
                }
            }
        }

        if self.response_done && self.body_done && out.to_write.is_empty() {
            self.sender.close("Exchange complete");
            shared.metrics.service_time(self.started.elapsed());

            let reuse = self.keep_alive && !self.close_after;
            return Poll::Ready(Ok(Step::Done { reuse }));
        }

        if progress {
            Poll::Ready(Ok(Step::Progress))
        } else {
            Poll::Pending
        }
    }

    fn start_response(
        &mut self,
        head: ResponseHead,
        out: &mut Output,
        shared: &Arc<Shared>,
    ) -> Result<(), Error> {
        let ResponseHead {
            res,
            rx_body,
            close_after,
        } = head;

        write_http1x_res(&res, &mut out.to_write)?;
        out.flush_after = true;

        shared.metrics.response_status(res.status());

        self.rx_res = None;
        self.rx_body = Some(rx_body);
        self.response_started = true;
        self.close_after |= close_after;

        Ok(())
    }

    /// Move response body frames to the write buffer while it has room.
    fn pull_response_body(
        &mut self,
        cx: &mut Context<'_>,
        out: &mut Output,
        shared: &Arc<Shared>,
    ) -> Result<bool, Error> {
        let mut progress = false;

        while out.to_write.len() < shared.config.response_chunk_size {
            let rx = match &mut self.rx_body {
                Some(v) => v,
                None => break,
            };

            match Pin::new(rx).poll_next(cx) {
                Poll::Pending => break,
                Poll::Ready(Some(Frame::Data(data))) => {
                    out.to_write.extend_from_slice(&data);
                }
                Poll::Ready(Some(Frame::Flush)) => {
                    out.flush_after = true;
                }
                Poll::Ready(Some(Frame::End { written })) => {
                    trace!("Response to {} done: {} bytes", self.request_id, written);
                    shared.metrics.response_content_length(written);
                    out.flush_after = true;
                    self.rx_body = None;
                    self.response_done = true;
                }
                Poll::Ready(Some(Frame::Abort)) | Poll::Ready(None) => {
                    return Err(Error::Aborted(format!(
                        "Response to request {} was not completed",
                        self.request_id
                    )));
                }
            }

            progress = true;
        }

        Ok(progress)
    }

    fn abort(&mut self, reason: &str) {
        self.sender.close(reason);
        // an undispatched request is simply dropped
        self.ctx.take();
        if let Some(exchange) = self.exchange.upgrade() {
            exchange.abort(reason);
        }
    }
}

// ***************** Boiler plate to hide IO behind a Box<dyn trait> ***************

trait Io: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

struct IoAdapt<S>(S);

impl<S> Io for IoAdapt<S> where S: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<S> AsyncRead for IoAdapt<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_read(cx, buf)
    }
}

impl<S> AsyncWrite for IoAdapt<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_write(cx, buf)
    }
    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_flush(cx)
    }
    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.0).poll_close(cx)
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Waiting => write!(f, "Waiting"),
            State::Closed => write!(f, "Closed"),
            State::Exchange(p) => write!(
                f,
                "Exchange {} body_done: {}, response_started: {}, response_done: {}",
                p.request_id, p.body_done, p.response_started, p.response_done
            ),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Connection({})", self.0.conn_id)
    }
}

#[cfg(test)]
pub(crate) fn test_shared(
    rt: &tokio::runtime::Runtime,
    metrics: Arc<dyn Metrics>,
) -> Arc<Shared> {
    let dispatcher: Arc<dyn Dispatcher> =
        Arc::new(|_: RequestContext| -> Result<(), Error> { Ok(()) });
    Arc::new(Shared::new(
        ServerConfig::default(),
        dispatcher,
        metrics,
        rt.handle().clone(),
        rt.handle().clone(),
    ))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::metrics::NoopMetrics;
    use futures_util::io::Cursor;
    use std::io::Read;

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .enable_all()
            .build()
            .unwrap()
    }

    fn upload(shared: &Arc<Shared>) -> Pending {
        let req = http::Request::builder()
            .method("POST")
            .uri("/upload")
            .header("content-length", "1000")
            .body(())
            .unwrap();
        Pending::begin(shared, shared.next_connection_id(), req, BodyKind::Length(1000))
    }

    #[test]
    fn abort_releases_body_kept_by_dispatcher() {
        let rt = runtime();
        let shared = test_shared(&rt, Arc::new(NoopMetrics));

        let mut pending = upload(&shared);
        // what a suspended dispatcher keeps around
        let (_, mut entity, exchange) = pending.ctx.take().unwrap().into_parts();

        let chunks: Vec<Bytes> = (0..4).map(|i| Bytes::from(vec![i; 100])).collect();
        for c in &chunks {
            pending.sender.add_buffer(c.clone(), false).unwrap();
        }
        assert!(chunks.iter().all(|c| !c.is_unique()));
        assert_eq!(entity.available(), 400);

        pending.abort("connection reset by peer");

        assert!(chunks.iter().all(|c| c.is_unique()));
        assert_eq!(entity.available(), 0);
        assert!(exchange.is_failed());

        let mut buf = [0_u8; 10];
        assert!(entity.read(&mut buf).is_err());
    }

    #[test]
    fn dropped_connection_releases_body() {
        let rt = runtime();
        let shared = test_shared(&rt, Arc::new(NoopMetrics));

        let mut codec = Codec::new(
            Cursor::new(Vec::new()),
            shared.next_connection_id(),
            shared.clone(),
        );

        let mut pending = upload(&shared);
        let (_, mut entity, exchange) = pending.ctx.take().unwrap().into_parts();

        let chunk = Bytes::from(vec![1_u8; 500]);
        pending.sender.add_buffer(chunk.clone(), false).unwrap();

        // partly read before the connection goes away
        let mut buf = [0_u8; 100];
        entity.read_exact(&mut buf).unwrap();
        assert!(!chunk.is_unique());

        codec.state = State::Exchange(Box::new(pending));
        drop(codec);

        assert!(chunk.is_unique());
        assert!(exchange.is_completed());
        assert!(entity.read(&mut buf).is_err());
    }

    #[test]
    fn undispatched_request_is_dropped_on_abort() {
        let rt = runtime();
        let shared = test_shared(&rt, Arc::new(NoopMetrics));

        let mut pending = upload(&shared);
        let chunk = Bytes::from(vec![3_u8; 64]);
        pending.sender.add_buffer(chunk.clone(), false).unwrap();

        pending.abort("idle timeout");

        assert!(pending.ctx.is_none());
        assert!(chunk.is_unique());
    }
}
