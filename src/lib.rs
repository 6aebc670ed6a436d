#![warn(missing_debug_implementations)]
#![warn(clippy::all)]

//! An HTTP/1.1 server connection layer for blocking request handlers.
//!
//! Connections are driven asynchronously on a small pool of I/O threads, while
//! each request is handed to a [`Dispatcher`] on a worker thread where it can
//! block freely. The request body is read with `std::io::Read` and the response
//! body written with `std::io::Write`; the connection moves the bytes in between
//! without ever blocking an I/O thread.
//!
//! ## In scope
//!
//! * `Content-Length` and `Transfer-Encoding: chunked` for request and response
//!   bodies, enforcing declared sizes.
//! * `Connection: keep-alive` / `close` and HTTP/1.0 peers.
//! * Pipelined requests, answered strictly in order.
//! * `Expect: 100-continue`, sent when the handler starts reading the body.
//! * Backpressure: the socket is only read while the handler keeps up with the
//!   request body.
//! * Suspended exchanges, completed later from any thread, with timeouts.
//!
//! ## Out of scope
//!
//! Routing, authentication, content negotiation, compression, TLS and HTTP/2.
//!
//! # Layout and API
//!
//! [`Server`] binds and runs the thread pools. Each request arrives as a
//! [`RequestContext`], with the body as an [`InboundEntity`] and the response side
//! as an [`Exchange`]. `Exchange::write_status_and_headers` sends the response
//! head and returns the [`OutboundEntity`] to write the body to.
//!
//! Metrics are pushed to an injected [`Metrics`] implementation. Logging goes
//! through the `log` facade.

#[macro_use]
extern crate log;

mod chunked;
mod codec;
mod config;
mod error;
mod exchange;
mod gate;
mod inbound;
mod io;
mod limit;
mod listener;
mod metrics;
mod outbound;
mod pipeline;
mod server;
mod try_write;

#[doc(hidden)]
pub mod http11;

pub(crate) use futures_io::{AsyncRead, AsyncWrite};

pub use config::ServerConfig;
pub use error::Error;
pub use exchange::{ConnectionId, Dispatcher, Exchange, RequestContext, RequestId};
pub use exchange::{TimeoutHandler, FAILURE_ID_HEADER, REQUEST_ID_HEADER};
pub use inbound::InboundEntity;
pub use limit::BodyKind;
pub use listener::Server;
pub use metrics::{Metrics, NoopMetrics, RecorderMetrics};
pub use outbound::OutboundEntity;
