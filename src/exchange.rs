//! The contract between a connection and the request dispatcher.
//!
//! Each request is handed to a [`Dispatcher`] on a worker thread as a
//! [`RequestContext`]. The response goes back through the request's
//! [`Exchange`], which can be used from any thread and completes exactly once,
//! either by `commit()` or by `failure()`.

use crate::inbound::InboundEntity;
use crate::limit::LimitWrite;
use crate::outbound::{self, Frame, OutboundEntity, OutboundHandle};
use crate::server::Shared;
use crate::Error;
use futures_channel::{mpsc, oneshot};
use http::header::{HeaderMap, HeaderValue};
use http::StatusCode;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// Header carrying the request identifier, read from the request if present and
/// always echoed on the response.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Header an error-mapping layer may set to correlate a failure. Passed through
/// untouched.
pub const FAILURE_ID_HEADER: &str = "x-failure-id";

/// Handles requests. Called on a worker thread, where it may block.
///
/// Returning an error (or panicking) fails the exchange. Returning `Ok` without
/// having suspended commits the response.
pub trait Dispatcher: Send + Sync + 'static {
    fn handle(&self, ctx: RequestContext) -> Result<(), Error>;
}

impl<F> Dispatcher for F
where
    F: Fn(RequestContext) -> Result<(), Error> + Send + Sync + 'static,
{
    fn handle(&self, ctx: RequestContext) -> Result<(), Error> {
        self(ctx)
    }
}

/// Called on a worker thread when a suspended exchange times out. It is
/// expected to eventually complete the exchange.
pub trait TimeoutHandler: Send + Sync + 'static {
    fn on_timeout(&self, exchange: &Exchange);
}

impl<F> TimeoutHandler for F
where
    F: Fn(&Exchange) + Send + Sync + 'static,
{
    fn on_timeout(&self, exchange: &Exchange) {
        self(exchange)
    }
}

/// Identifier of one request, taken from the `x-request-id` header or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        RequestId(uuid::Uuid::new_v4().to_string())
    }

    pub(crate) fn from_header(v: &HeaderValue) -> Option<Self> {
        v.to_str()
            .ok()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| RequestId(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of the connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// One request as seen by the dispatcher.
///
/// The `RequestId` and `ConnectionId` are also available from `extensions()`.
pub struct RequestContext {
    head: http::request::Parts,
    entity: InboundEntity,
    exchange: Exchange,
}

impl RequestContext {
    pub(crate) fn new(head: http::request::Parts, entity: InboundEntity, exchange: Exchange) -> Self {
        RequestContext {
            head,
            entity,
            exchange,
        }
    }

    pub fn method(&self) -> &http::Method {
        &self.head.method
    }

    pub fn uri(&self) -> &http::Uri {
        &self.head.uri
    }

    pub fn version(&self) -> http::Version {
        self.head.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.head.headers
    }

    pub fn extensions(&self) -> &http::Extensions {
        &self.head.extensions
    }

    pub fn request_id(&self) -> &RequestId {
        self.exchange.request_id()
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.head.extensions.get::<ConnectionId>().copied()
    }

    /// The request body.
    pub fn entity(&mut self) -> &mut InboundEntity {
        &mut self.entity
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    pub fn into_parts(self) -> (http::request::Parts, InboundEntity, Exchange) {
        (self.head, self.entity, self.exchange)
    }
}

impl fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestContext")
            .field("method", &self.head.method)
            .field("uri", &self.head.uri)
            .field("request_id", self.exchange.request_id())
            .finish()
    }
}

/// What the connection receives once the response head is decided.
pub(crate) struct ResponseHead {
    pub res: http::Response<()>,
    pub rx_body: mpsc::UnboundedReceiver<Frame>,
    /// Close the connection after this response.
    pub close_after: bool,
}

/// A complete response without body that closes the connection after it.
pub(crate) fn error_head(
    request_id: &RequestId,
    version: http::Version,
    status: StatusCode,
) -> ResponseHead {
    let mut headers = HeaderMap::new();

    let limit = LimitWrite::for_response(Some(0), status, version, false);
    limit.set_headers(&mut headers, Some(0), status);
    set_connection_headers(&mut headers, request_id, version, true);

    let mut res = http::Response::new(());
    *res.status_mut() = status;
    *res.version_mut() = version;
    *res.headers_mut() = headers;

    let (mut entity, rx_body) = outbound::channel(limit, 1);
    // an empty body always closes cleanly
    let _ = entity.close();

    ResponseHead {
        res,
        rx_body,
        close_after: true,
    }
}

fn set_connection_headers(
    headers: &mut HeaderMap,
    request_id: &RequestId,
    version: http::Version,
    close_after: bool,
) {
    match HeaderValue::from_str(request_id.as_str()) {
        Ok(v) => {
            headers.insert(REQUEST_ID_HEADER, v);
        }
        Err(e) => debug!("Request id not usable as header: {}", e),
    }

    if close_after {
        headers.insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    } else if version == http::Version::HTTP_10 {
        headers.insert(
            http::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );
    }
}

/// Response side of one request/response exchange.
///
/// Cheap to clone, and usable from any thread.
#[derive(Clone)]
pub struct Exchange {
    inner: Arc<Inner>,
}

struct Inner {
    request_id: RequestId,
    version: http::Version,
    keep_alive: bool,
    head_request: bool,
    shared: Arc<Shared>,
    /// Bumped on every timeout registration and on completion. A timer only
    /// fires if the generation it was armed with is still current.
    generation: AtomicU64,
    state: Mutex<State>,
}

struct State {
    tx_res: Option<oneshot::Sender<ResponseHead>>,
    outbound: Option<OutboundHandle>,
    handler: Option<Arc<dyn TimeoutHandler>>,
    completed: bool,
    failed: bool,
}

impl Exchange {
    pub(crate) fn new(
        shared: Arc<Shared>,
        head: &http::request::Parts,
        request_id: RequestId,
        keep_alive: bool,
        tx_res: oneshot::Sender<ResponseHead>,
    ) -> Self {
        Exchange {
            inner: Arc::new(Inner {
                request_id,
                version: head.version,
                keep_alive,
                head_request: head.method == http::Method::HEAD,
                shared,
                generation: AtomicU64::new(0),
                state: Mutex::new(State {
                    tx_res: Some(tx_res),
                    outbound: None,
                    handler: None,
                    completed: false,
                    failed: false,
                }),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_id(&self) -> &RequestId {
        &self.inner.request_id
    }

    /// Send the response status and headers, and get the writer for the body.
    ///
    /// `content_length` decides the framing: `None` streams the body chunked,
    /// `Some(0)` sends no body (writes are rejected), anything else is a fixed
    /// length body. Can only be called once per exchange.
    pub fn write_status_and_headers(
        &self,
        content_length: Option<u64>,
        status: StatusCode,
        mut headers: HeaderMap,
    ) -> Result<OutboundEntity, Error> {
        let mut state = self.lock();

        if state.completed && state.tx_res.is_none() {
            return Err(Error::User("Exchange is already completed".into()));
        }

        let tx_res = state
            .tx_res
            .take()
            .ok_or_else(|| Error::User("Response status and headers already written".into()))?;

        let limit = LimitWrite::for_response(
            content_length,
            status,
            self.inner.version,
            self.inner.head_request,
        );
        limit.set_headers(&mut headers, content_length, status);

        let close_after = !self.inner.keep_alive || limit.is_close_delimited();
        set_connection_headers(
            &mut headers,
            &self.inner.request_id,
            self.inner.version,
            close_after,
        );

        let mut res = http::Response::new(());
        *res.status_mut() = status;
        *res.version_mut() = self.inner.version;
        *res.headers_mut() = headers;

        let chunk_size = self.inner.shared.config.response_chunk_size;
        let (entity, rx_body) = outbound::channel(limit, chunk_size);

        let head = ResponseHead {
            res,
            rx_body,
            close_after,
        };

        if tx_res.send(head).is_err() {
            entity.handle().mark_failed();
            return Err(Error::Aborted(
                "Connection closed before the response was sent".into(),
            ));
        }

        state.outbound = Some(entity.handle());

        Ok(entity)
    }

    fn internal_error_head(&self) -> ResponseHead {
        error_head(
            &self.inner.request_id,
            self.inner.version,
            StatusCode::INTERNAL_SERVER_ERROR,
        )
    }

    pub(crate) fn downgrade(&self) -> WeakExchange {
        WeakExchange(Arc::downgrade(&self.inner))
    }

    /// Mark the exchange as suspended: it will complete later, from some other
    /// thread or through `handler` when a timeout set by `set_timeout` fires.
    ///
    /// The same handler may be registered again, a different one is rejected.
    pub fn suspend(&self, handler: Arc<dyn TimeoutHandler>) -> Result<(), Error> {
        let mut state = self.lock();

        if state.completed {
            return Err(Error::User("Exchange is already completed".into()));
        }

        if let Some(existing) = &state.handler {
            let same = Arc::as_ptr(existing) as *const () == Arc::as_ptr(&handler) as *const ();
            if !same {
                return Err(Error::User(
                    "Exchange is already suspended with another timeout handler".into(),
                ));
            }
            return Ok(());
        }

        trace!("Suspend request {}", self.inner.request_id);
        state.handler = Some(handler);
        self.inner.shared.metrics.suspended();

        Ok(())
    }

    /// (Re)arm the timeout of a suspended exchange. Any earlier timeout is superseded.
    pub fn set_timeout(&self, timeout: Duration) -> Result<(), Error> {
        {
            let state = self.lock();
            if state.completed {
                return Err(Error::User("Exchange is already completed".into()));
            }
            if state.handler.is_none() {
                return Err(Error::User("Timeout set on exchange that is not suspended".into()));
            }
        }

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        // a suspended exchange may have no other owner than its timer
        let exchange = self.clone();
        let workers = self.inner.shared.workers.clone();

        trace!(
            "Timeout {:?} for request {} (generation {})",
            timeout,
            self.inner.request_id,
            generation
        );

        self.inner.shared.reactor.spawn(async move {
            tokio::time::sleep(timeout).await;

            if exchange.inner.generation.load(Ordering::SeqCst) != generation {
                trace!("Ignore superseded timeout (generation {})", generation);
                return;
            }

            workers.spawn_blocking(move || exchange.fire_timeout(generation));
        });

        Ok(())
    }

    fn fire_timeout(&self, generation: u64) {
        let handler = {
            let state = self.lock();
            if state.completed || self.inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            state.handler.clone()
        };

        if let Some(handler) = handler {
            debug!("Request {} timed out", self.inner.request_id);
            let r = panic::catch_unwind(AssertUnwindSafe(|| handler.on_timeout(self)));
            if r.is_err() {
                self.failure(Error::User("Timeout handler panicked".into()));
            }
        }
    }

    /// Run `f` on the worker pool, typically to complete a suspended exchange.
    pub fn resume<F>(&self, f: F)
    where
        F: FnOnce(&Exchange) + Send + 'static,
    {
        let exchange = self.clone();
        self.inner.shared.workers.spawn_blocking(move || {
            if panic::catch_unwind(AssertUnwindSafe(|| f(&exchange))).is_err() {
                exchange.failure(Error::User("Resumed continuation panicked".into()));
            }
        });
    }

    pub fn is_suspended(&self) -> bool {
        let state = self.lock();
        state.handler.is_some() && !state.completed
    }

    pub fn is_completed(&self) -> bool {
        self.lock().completed
    }

    pub fn is_failed(&self) -> bool {
        self.lock().failed
    }

    /// Complete the exchange: closes the response body. Without a prior
    /// `write_status_and_headers` a bare `500` is sent instead.
    pub fn commit(&self) -> Result<(), Error> {
        let outbound = {
            let mut state = self.lock();
            if state.completed {
                return Ok(());
            }
            state.completed = true;
            self.inner.generation.fetch_add(1, Ordering::SeqCst);

            if let Some(tx_res) = state.tx_res.take() {
                warn!(
                    "Request {} committed without a response",
                    self.inner.request_id
                );
                state.failed = true;
                self.inner.shared.metrics.failed();
                let _ = tx_res.send(self.internal_error_head());
                return Ok(());
            }

            state.outbound.clone()
        };

        let ret = match outbound {
            Some(o) => o.close().and_then(|_| {
                if o.is_failed() {
                    Err(Error::Aborted("Response body was not completed".into()))
                } else {
                    Ok(())
                }
            }),
            None => Ok(()),
        };

        if ret.is_ok() {
            self.inner.shared.metrics.succeeded();
        } else {
            self.lock().failed = true;
            self.inner.shared.metrics.failed();
        }

        ret
    }

    /// Fail the exchange. If no response has started, a bare `500` is sent,
    /// otherwise the response is cut short. Either way the connection closes.
    pub fn failure(&self, err: Error) {
        let mut state = self.lock();

        if state.completed {
            debug!(
                "Failure after completion of request {}: {}",
                self.inner.request_id, err
            );
            return;
        }

        state.completed = true;
        state.failed = true;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        warn!("Request {} failed: {}", self.inner.request_id, err);
        self.inner.shared.metrics.failed();

        if let Some(tx_res) = state.tx_res.take() {
            let _ = tx_res.send(self.internal_error_head());
        } else if let Some(outbound) = &state.outbound {
            outbound.mark_failed();
            let _ = outbound.close();
        }
    }

    /// Connection side teardown. Nothing more is sent for this exchange.
    pub(crate) fn abort(&self, reason: &str) {
        let mut state = self.lock();

        if !state.completed {
            debug!("Abort request {}: {}", self.inner.request_id, reason);
            state.failed = true;
        }
        state.completed = true;
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        state.tx_res.take();

        if let Some(outbound) = &state.outbound {
            outbound.mark_failed();
            let _ = outbound.close();
        }
    }
}

/// Reference to an exchange that doesn't keep it alive. Once every `Exchange`
/// handle is gone without a response, the connection sees it and answers `500`.
#[derive(Clone)]
pub(crate) struct WeakExchange(Weak<Inner>);

impl WeakExchange {
    pub fn upgrade(&self) -> Option<Exchange> {
        self.0.upgrade().map(|inner| Exchange { inner })
    }
}

impl fmt::Debug for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exchange({})", self.inner.request_id)
    }
}

/// Call the dispatcher for one request, on a worker thread.
pub(crate) fn run_dispatcher(dispatcher: &dyn Dispatcher, ctx: RequestContext) {
    let exchange = ctx.exchange.clone();

    trace!("Dispatch request {}", exchange.request_id());

    match panic::catch_unwind(AssertUnwindSafe(|| dispatcher.handle(ctx))) {
        Ok(Ok(())) => {
            if exchange.is_suspended() {
                trace!("Request {} is suspended", exchange.request_id());
                return;
            }
            if let Err(e) = exchange.commit() {
                debug!("Commit of request {} failed: {}", exchange.request_id(), e);
            }
        }
        Ok(Err(e)) => exchange.failure(e),
        Err(_) => exchange.failure(Error::User("Dispatcher panicked".into())),
    }
}
