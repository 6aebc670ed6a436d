//! Server configuration.
//!
//! Every field has a default, so a configuration file only needs to name what
//! it changes. Reading the file is up to the application.

use crate::Error;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind, e.g. `0.0.0.0` or `127.0.0.1`.
    pub host: String,

    /// Port to bind. `0` picks a free port, see `Server::local_addr`.
    pub port: u16,

    /// Close connections without any socket activity for this long.
    pub idle_timeout_ms: u64,

    pub max_accept_backlog: u32,

    /// Threads driving connections (and timers).
    pub io_threads: usize,

    /// Maximum number of concurrent dispatcher calls.
    pub worker_threads: usize,

    /// Unread request body bytes at which reading from the socket pauses.
    pub high_watermark: usize,

    /// Unread request body bytes at which reading resumes.
    pub low_watermark: usize,

    /// Allocate each connection's read buffer at full size up front.
    pub direct_buffers: bool,

    /// Response body bytes collected before handing a chunk to the connection.
    pub response_chunk_size: usize,

    /// Largest accepted request head (start line and headers).
    pub max_header_size: usize,

    /// How long `Server::stop` waits for connections to finish.
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            idle_timeout_ms: 60_000,
            max_accept_backlog: 1024,
            io_threads: 4,
            worker_threads: 64,
            high_watermark: 64 * 1024,
            low_watermark: 16 * 1024,
            direct_buffers: false,
            response_chunk_size: 8192,
            max_header_size: 16_384,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, Error> {
        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|e| Error::User(format!("Invalid host '{}': {}", self.host, e)))?;
        Ok(SocketAddr::new(ip, self.port))
    }

    /// Check the configuration, reporting all problems at once.
    pub fn validate(&self) -> Result<(), Error> {
        let mut problems = vec![];

        if let Err(e) = self.bind_addr() {
            problems.push(e.to_string());
        }
        if self.idle_timeout_ms == 0 {
            problems.push("idle_timeout_ms must be > 0".to_string());
        }
        if self.max_accept_backlog == 0 {
            problems.push("max_accept_backlog must be > 0".to_string());
        }
        if self.io_threads == 0 {
            problems.push("io_threads must be > 0".to_string());
        }
        if self.worker_threads == 0 {
            problems.push("worker_threads must be > 0".to_string());
        }
        if self.high_watermark == 0 {
            problems.push("high_watermark must be > 0".to_string());
        }
        if self.low_watermark > self.high_watermark {
            problems.push(format!(
                "low_watermark ({}) must not exceed high_watermark ({})",
                self.low_watermark, self.high_watermark
            ));
        }
        if self.response_chunk_size == 0 {
            problems.push("response_chunk_size must be > 0".to_string());
        }
        if self.max_header_size < 64 {
            problems.push("max_header_size must be at least 64".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::User(format!(
                "Invalid server configuration: {}",
                problems.join("; ")
            )))
        }
    }
}
