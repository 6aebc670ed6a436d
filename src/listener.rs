//! Listening socket and the thread pools of a running server.
//!
//! Three tokio runtimes make up a server. A single threaded acceptor runs the
//! accept loop, an I/O runtime with `io_threads` threads drives connections and
//! timeouts, and the blocking pool of a worker runtime (capped at
//! `worker_threads`) runs dispatcher calls.

use crate::config::ServerConfig;
use crate::exchange::Dispatcher;
use crate::metrics::{Metrics, NoopMetrics};
use crate::pipeline::serve_connection;
use crate::server::Shared;
use crate::Error;
use futures_channel::oneshot;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket};
use tokio::runtime::{Builder, Runtime};

/// A running HTTP/1.1 server.
///
/// ```no_run
/// use h1_bridge::{Error, RequestContext, Server, ServerConfig};
/// use http::{HeaderMap, StatusCode};
/// use std::io::Write;
///
/// let config = ServerConfig {
///     port: 3000,
///     ..Default::default()
/// };
///
/// let server = Server::start(config, |ctx: RequestContext| -> Result<(), Error> {
///     let body = b"Hello world!\n";
///     let mut out = ctx.exchange().write_status_and_headers(
///         Some(body.len() as u64),
///         StatusCode::OK,
///         HeaderMap::new(),
///     )?;
///     out.write_all(body)?;
///     Ok(())
/// })?;
///
/// println!("Listening on {}", server.local_addr());
/// # Ok::<(), Error>(())
/// ```
pub struct Server {
    local_addr: SocketAddr,
    grace: Duration,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: oneshot::Sender<()>,
    acceptor: Runtime,
    io: Runtime,
    workers: Runtime,
}

impl Server {
    /// Bind and start serving with `dispatcher`.
    pub fn start<D: Dispatcher>(config: ServerConfig, dispatcher: D) -> Result<Server, Error> {
        Server::start_with_metrics(config, Arc::new(dispatcher), Arc::new(NoopMetrics))
    }

    pub fn start_with_metrics(
        config: ServerConfig,
        dispatcher: Arc<dyn Dispatcher>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Server, Error> {
        config.validate()?;
        let addr = config.bind_addr()?;

        let acceptor = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("h1-acceptor")
            .enable_all()
            .build()?;

        let io = Builder::new_multi_thread()
            .worker_threads(config.io_threads)
            .thread_name("h1-io")
            .enable_all()
            .build()?;

        let workers = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(config.worker_threads)
            .thread_name("h1-worker")
            .enable_all()
            .build()?;

        let listener = {
            let _guard = acceptor.enter();
            bind(addr, config.max_accept_backlog)?
        };
        let local_addr = listener.local_addr()?;

        info!("Listening on {}", local_addr);

        let grace = config.shutdown_grace();

        let shared = Arc::new(Shared::new(
            config,
            dispatcher,
            metrics,
            io.handle().clone(),
            workers.handle().clone(),
        ));

        let (shutdown, rx_shutdown) = oneshot::channel();
        acceptor.spawn(accept_loop(listener, shared, rx_shutdown));

        Ok(Server {
            local_addr,
            grace,
            running: Mutex::new(Some(Running {
                shutdown,
                acceptor,
                io,
                workers,
            })),
        })
    }

    /// The bound address, useful when binding port `0`.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Stop accepting, close the listening socket and release all threads.
    /// Connections still open are closed. Calling it again does nothing.
    ///
    /// Blocks for up to `shutdown_grace_ms`. Must not be called from the
    /// server's own threads (i.e. from a dispatcher).
    pub fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let running = match running {
            Some(v) => v,
            None => return,
        };

        info!("Stopping server on {}", self.local_addr);

        let _ = running.shutdown.send(());
        running.acceptor.shutdown_timeout(self.grace);
        running.io.shutdown_timeout(self.grace);
        running.workers.shutdown_background();

        debug!("Server on {} stopped", self.local_addr);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server({})", self.local_addr)
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("Accept loop stopped");
                return;
            }
            r = listener.accept() => match r {
                Ok((tcp, peer)) => {
                    trace!("Accepted connection from {}", peer);
                    // move the socket over to the I/O runtime's reactor
                    match tcp.into_std() {
                        Ok(tcp) => {
                            shared.reactor.spawn(serve_connection(tcp, shared.clone()));
                        }
                        Err(e) => warn!("Failed to hand over connection from {}: {}", peer, e),
                    }
                }
                Err(e) => {
                    warn!("Accept failed: {}", e);
                    // typically out of file descriptors, don't spin
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}
