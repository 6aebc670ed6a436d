#![allow(dead_code)]

use h1_bridge::{Dispatcher, Error, RequestContext, Server, ServerConfig};
use http::{HeaderMap, StatusCode};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;
use std::sync::Once;
use std::time::Duration;

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("h1_bridge", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

pub fn config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        io_threads: 2,
        worker_threads: 8,
        shutdown_grace_ms: 500,
        ..Default::default()
    }
}

pub fn start<D: Dispatcher>(dispatcher: D) -> Server {
    start_with(config(), dispatcher)
}

pub fn start_with<D: Dispatcher>(config: ServerConfig, dispatcher: D) -> Server {
    setup_logger();
    Server::start(config, dispatcher).expect("Start server")
}

pub fn connect(server: &Server) -> io::Result<TcpStream> {
    let tcp = TcpStream::connect(server.local_addr())?;
    tcp.set_read_timeout(Some(Duration::from_secs(10)))?;
    tcp.set_nodelay(true)?;
    Ok(tcp)
}

/// Read the whole request body and answer with it as a fixed size response.
pub fn echo(mut ctx: RequestContext) -> Result<(), Error> {
    let mut body = vec![];
    ctx.entity().read_to_end(&mut body)?;

    let mut out = ctx.exchange().write_status_and_headers(
        Some(body.len() as u64),
        StatusCode::OK,
        HeaderMap::new(),
    )?;
    out.write_all(&body)?;

    Ok(())
}

/// Answer with a fixed body.
pub fn reply(ctx: &RequestContext, status: StatusCode, body: &[u8]) -> Result<(), Error> {
    let mut out =
        ctx.exchange()
            .write_status_and_headers(Some(body.len() as u64), status, HeaderMap::new())?;
    out.write_all(body)?;
    out.close()
}

#[derive(Debug)]
pub struct Response {
    pub version: String,
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).expect("Body is utf-8")
    }
}

/// Minimal blocking HTTP/1.1 response parser.
pub struct ResponseReader<R> {
    inner: BufReader<R>,
}

impl<R: Read> ResponseReader<R> {
    pub fn new(r: R) -> Self {
        ResponseReader {
            inner: BufReader::with_capacity(64 * 1024, r),
        }
    }

    /// Status line and headers. `None` on a clean end of stream.
    pub fn read_head(&mut self) -> io::Result<Option<Response>> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            return Ok(None);
        }

        let mut parts = line.trim_end().splitn(3, ' ');
        let version = parts.next().unwrap_or_default().to_string();
        let status = parts
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, line.clone()))?;

        let mut headers = vec![];
        loop {
            let mut line = String::new();
            if self.inner.read_line(&mut line)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            let line = line.trim_end();
            if line.is_empty() {
                break;
            }
            let (k, v) = line
                .split_once(':')
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, line.to_string()))?;
            headers.push((k.trim().to_string(), v.trim().to_string()));
        }

        Ok(Some(Response {
            version,
            status,
            headers,
            body: vec![],
        }))
    }

    /// A complete final response, skipping interim `1xx` ones.
    pub fn read_response(&mut self) -> io::Result<Option<Response>> {
        self.read_response_to(false)
    }

    pub fn read_head_response(&mut self) -> io::Result<Option<Response>> {
        self.read_response_to(true)
    }

    fn read_response_to(&mut self, head_request: bool) -> io::Result<Option<Response>> {
        loop {
            let mut res = match self.read_head()? {
                Some(v) => v,
                None => return Ok(None),
            };
            if res.status / 100 == 1 {
                continue;
            }
            self.read_body(&mut res, head_request)?;
            return Ok(Some(res));
        }
    }

    pub fn read_body(&mut self, res: &mut Response, head_request: bool) -> io::Result<()> {
        if head_request || res.status == 204 || res.status == 304 {
            return Ok(());
        }

        let chunked = res
            .header("transfer-encoding")
            .map(|v| v.contains("chunked"))
            .unwrap_or(false);

        if chunked {
            loop {
                let mut line = String::new();
                self.inner.read_line(&mut line)?;
                let size = line.trim_end().split(';').next().unwrap_or_default();
                let size = usize::from_str_radix(size, 16)
                    .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, line.clone()))?;
                if size == 0 {
                    // trailers
                    loop {
                        let mut line = String::new();
                        self.inner.read_line(&mut line)?;
                        if line.trim_end().is_empty() {
                            return Ok(());
                        }
                    }
                }
                let start = res.body.len();
                res.body.resize(start + size, 0);
                self.inner.read_exact(&mut res.body[start..])?;
                let mut crlf = [0_u8; 2];
                self.inner.read_exact(&mut crlf)?;
            }
        } else if let Some(len) = res.header("content-length") {
            let len: usize = len
                .parse()
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, len.to_string()))?;
            res.body.resize(len, 0);
            self.inner.read_exact(&mut res.body)?;
            Ok(())
        } else {
            self.inner.read_to_end(&mut res.body)?;
            Ok(())
        }
    }

    /// Whether the peer has closed the connection (after everything was read).
    pub fn is_eof(&mut self) -> bool {
        match self.inner.fill_buf() {
            Ok(buf) => buf.is_empty(),
            Err(_) => true,
        }
    }
}

/// Send `req` on a fresh connection and read one response.
pub fn request(server: &Server, req: &[u8]) -> Result<Response, Error> {
    let mut tcp = connect(server)?;
    tcp.write_all(req)?;
    let mut reader = ResponseReader::new(tcp);
    let res = reader
        .read_response()?
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    Ok(res)
}
