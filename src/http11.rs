//! Request head parsing and response head encoding.

use crate::Error;
use bytes::{BufMut, BytesMut};
use http::header::{HeaderName, HeaderValue};
use std::io::Write;

// Request headers today vary in size from ~200 bytes to over 2KB.
// As applications use more cookies and user agents expand features,
// typical header sizes of 700-800 bytes is common.
// http://dev.chromium.org/spdy/spdy-whitepaper

/// Max number of headers accepted in one request.
const MAX_HEADERS: usize = 128;

fn version_str(v: http::Version) -> Result<&'static str, Error> {
    match v {
        http::Version::HTTP_10 => Ok("1.0"),
        http::Version::HTTP_11 => Ok("1.1"),
        _ => Err(Error::User(format!("Unsupported http version: {:?}", v))),
    }
}

/// Write an http/1.x response head to a buffer.
#[allow(clippy::write_with_newline)]
pub fn write_http1x_res(res: &http::Response<()>, buf: &mut BytesMut) -> Result<usize, Error> {
    let start = buf.len();
    let mut w = buf.writer();

    write!(
        w,
        "HTTP/{} {} {}\r\n",
        version_str(res.version())?,
        res.status().as_u16(),
        res.status().canonical_reason().unwrap_or("Unknown")
    )?;

    for (name, value) in res.headers() {
        write!(w, "{}: ", name)?;
        w.write_all(value.as_bytes())?;
        write!(w, "\r\n")?;
    }
    write!(w, "\r\n")?;

    let buf = w.into_inner();
    let len = buf.len() - start;

    debug!(
        "write_http1x_res: {:?}",
        String::from_utf8_lossy(&buf[start..])
    );

    Ok(len)
}

/// Write the interim `100 Continue` status line.
pub fn write_continue(version: http::Version, buf: &mut BytesMut) {
    let line: &[u8] = if version == http::Version::HTTP_10 {
        b"HTTP/1.0 100 Continue\r\n\r\n"
    } else {
        b"HTTP/1.1 100 Continue\r\n\r\n"
    };
    buf.extend_from_slice(line);
}

/// Attempt to parse an http/1.1 request.
///
/// Returns `None` if the buffer does not yet hold a complete head, otherwise the
/// request and the number of bytes the head occupied.
pub fn try_parse_req(buf: &[u8]) -> Result<Option<(http::Request<()>, usize)>, Error> {
    trace!("try_parse_req: {:?}", String::from_utf8_lossy(buf));

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parser = httparse::Request::new(&mut headers);

    let status = parser.parse(buf)?;

    let len = match status {
        httparse::Status::Partial => return Ok(None),
        httparse::Status::Complete(len) => len,
    };

    let mut bld = http::Request::builder().version(if parser.version == Some(1) {
        http::Version::HTTP_11
    } else {
        http::Version::HTTP_10
    });

    if let Some(path) = parser.path {
        bld = bld.uri(path);
    }

    if let Some(method) = parser.method {
        bld = bld.method(method);
    }

    for head in parser.headers.iter() {
        let name = HeaderName::from_bytes(head.name.as_bytes());
        let value = HeaderValue::from_bytes(head.value);
        match (name, value) {
            (Ok(name), Ok(value)) => bld = bld.header(name, value),
            (Err(e), _) => {
                debug!("Dropping bad header name: {}", e);
            }
            (Ok(name), Err(e)) => {
                debug!("Dropping bad header value ({}): {}", name, e);
            }
        }
    }

    let built = bld.body(())?;

    debug!("try_parse_req success: {:?}", built);

    Ok(Some((built, len)))
}
