//! Per-connection assembly: idle guard, transport adapter, request ids and the
//! connection state machine, plus logging of how the connection ended.

use crate::exchange::{ConnectionId, RequestId, REQUEST_ID_HEADER};
use crate::io::{Activity, TokioIo};
use crate::server::{self, Shared};
use crate::Error;
use http::header::HeaderValue;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;

/// Make sure the request carries a request id, both as `x-request-id` header
/// and as a `RequestId` extension. A usable id sent by the peer is kept.
pub(crate) fn assign_request_id(req: &mut http::Request<()>) {
    let existing = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(RequestId::from_header);

    let id = match existing {
        Some(id) => id,
        None => {
            let id = RequestId::generate();
            match HeaderValue::from_str(id.as_str()) {
                Ok(v) => {
                    req.headers_mut().insert(REQUEST_ID_HEADER, v);
                }
                Err(e) => debug!("Generated request id not usable as header: {}", e),
            }
            id
        }
    };

    trace!("Request id: {}", id);
    req.extensions_mut().insert(id);
}

/// Serve one accepted socket until it closes, errors or sits idle for too long.
pub(crate) async fn serve_connection(tcp: std::net::TcpStream, shared: Arc<Shared>) {
    let opened = Instant::now();
    let conn_id = shared.next_connection_id();

    shared.metrics.connection_opened();

    let result = drive(tcp, conn_id, shared.clone()).await;

    match result {
        Ok(()) => debug!("{} closed", conn_id),
        Err(e) if e.is_disconnect() => debug!("{} disconnected: {}", conn_id, e),
        Err(e) => warn!("{} failed: {}", conn_id, e),
    }

    shared.metrics.connection_closed(opened.elapsed());
}

async fn drive(
    tcp: std::net::TcpStream,
    conn_id: ConnectionId,
    shared: Arc<Shared>,
) -> Result<(), Error> {
    let tcp = TcpStream::from_std(tcp)?;
    if let Err(e) = tcp.set_nodelay(true) {
        debug!("{} set_nodelay: {}", conn_id, e);
    }

    let peer = tcp.peer_addr().ok();
    debug!("{} accepted from {:?}", conn_id, peer);

    let idle = shared.config.idle_timeout();
    let activity = Activity::new();
    activity.touch();

    let io = TokioIo::new(tcp, activity.clone());
    let conn = server::serve(io, conn_id, shared);
    tokio::pin!(conn);

    loop {
        let deadline = tokio::time::Instant::from_std(activity.last() + idle);

        tokio::select! {
            ret = &mut conn => return ret,
            _ = tokio::time::sleep_until(deadline) => {
                if activity.last() + idle <= Instant::now() {
                    debug!("{} idle for {:?}, closing", conn_id, idle);
                    // dropping the connection aborts any exchange in flight
                    return Ok(());
                }
            }
        }
    }
}
