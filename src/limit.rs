use crate::chunked::{ChunkedDecoder, ChunkedEncoder};
use crate::Error;
use bytes::{Bytes, BytesMut};
use std::fmt;

/// Limit reading data given configuration from request headers.
pub(crate) enum LimitRead {
    /// Read from a chunked decoder. The decoder will know when there is no more
    /// data to be read.
    ChunkedDecoder(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// No expected body.
    NoBody,
}

/// How the body of a request is delimited, as told by its headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    /// No body (or `content-length: 0`).
    Empty,
    /// Body with a known length.
    Length(u64),
    /// Body using `transfer-encoding: chunked`.
    Chunked,
}

impl LimitRead {
    /// Create an instance from request headers.
    ///
    /// 1. If header `transfer-encoding: chunked` use chunked decoder regardless of other headers.
    /// 2. If header `content-length: <number>` use a reader limited by length
    /// 3. Otherwise consider there being no body.
    pub fn from_headers(headers: &http::HeaderMap<http::HeaderValue>) -> Result<Self, Error> {
        // https://tools.ietf.org/html/rfc7230#page-31
        // If a message is received with both a Transfer-Encoding and a
        // Content-Length header field, the Transfer-Encoding overrides the
        // Content-Length.
        let ret = if is_chunked(headers) {
            LimitRead::ChunkedDecoder(ChunkedDecoder::new())
        } else if let Some(v) = get_str(headers, "content-length") {
            // https://tools.ietf.org/html/rfc7230#section-3.3.3
            // If a message is received without Transfer-Encoding and with an
            // invalid Content-Length header field, then the message framing is
            // invalid and the recipient MUST treat it as an unrecoverable error.
            let size = v
                .trim()
                .parse::<u64>()
                .map_err(|_| Error::Protocol(format!("Invalid content-length: {:?}", v)))?;
            LimitRead::ContentLength(ContentLengthRead::new(size))
        } else {
            // Closing the connection cannot be used to indicate the end of a
            // request body, since it leaves no possibility for the server to send
            // back a response.
            LimitRead::NoBody
        };

        trace!("LimitRead from headers: {:?}", ret);

        Ok(ret)
    }

    pub fn is_no_body(&self) -> bool {
        match &self {
            LimitRead::ContentLength(r) => r.limit == 0,
            LimitRead::NoBody => true,
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match &self {
            LimitRead::ChunkedDecoder(v) => v.is_end(),
            LimitRead::ContentLength(v) => v.is_end(),
            LimitRead::NoBody => true,
        }
    }

    pub fn kind(&self) -> BodyKind {
        match self {
            _ if self.is_no_body() => BodyKind::Empty,
            LimitRead::ChunkedDecoder(_) => BodyKind::Chunked,
            LimitRead::ContentLength(v) => BodyKind::Length(v.limit),
            LimitRead::NoBody => BodyKind::Empty,
        }
    }

    /// Take some body data out of the buffer, respecting the limit.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        match self {
            LimitRead::ChunkedDecoder(v) => v.decode(buf),
            LimitRead::ContentLength(v) => Ok(v.decode(buf)),
            LimitRead::NoBody => Ok(None),
        }
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub(crate) struct ContentLengthRead {
    limit: u64,
    total: u64,
}

impl ContentLengthRead {
    fn new(limit: u64) -> Self {
        ContentLengthRead { limit, total: 0 }
    }

    fn is_end(&self) -> bool {
        self.total == self.limit
    }

    fn decode(&mut self, buf: &mut BytesMut) -> Option<Bytes> {
        let left = self.limit - self.total;

        if left == 0 || buf.is_empty() {
            return None;
        }

        let amount = left.min(buf.len() as u64) as usize;
        self.total += amount as u64;

        Some(buf.split_to(amount).freeze())
    }
}

/// Limit writing data by a strategy decided by the response.
///
/// This is to ensure we don't write more data than "promised" by response
/// header configuration.
pub(crate) enum LimitWrite {
    /// Write data using a chunked encoder.
    ChunkedEncoder,
    /// Limit the write by the `content-length` header.
    ContentLength(ContentLengthWrite),
    /// Body is delimited by closing the connection (HTTP/1.0 with unknown length).
    CloseDelimited,
    /// There should be no body.
    NoBody,
}

impl LimitWrite {
    /// Pick the output mode for a response.
    ///
    /// 1. Responses that by definition have no body get `NoBody`.
    /// 2. A known content length gets `ContentLength`, where 0 means `NoBody`.
    /// 3. Otherwise `ChunkedEncoder`, or `CloseDelimited` for HTTP/1.0 peers.
    pub fn for_response(
        content_length: Option<u64>,
        status: http::StatusCode,
        version: http::Version,
        head_request: bool,
    ) -> Self {
        // https://tools.ietf.org/html/rfc7230#page-31
        // any response with a 1xx (Informational), 204 (No Content), or
        // 304 (Not Modified) status code is always terminated by the first
        // empty line after the header fields, regardless of the header fields
        // present in the message, and thus cannot contain a message body.
        let ret = if head_request
            || status.is_informational()
            || status == http::StatusCode::NO_CONTENT
            || status == http::StatusCode::NOT_MODIFIED
        {
            LimitWrite::NoBody
        } else if let Some(limit) = content_length {
            if limit == 0 {
                LimitWrite::NoBody
            } else {
                LimitWrite::ContentLength(ContentLengthWrite::new(limit))
            }
        } else if version == http::Version::HTTP_10 {
            LimitWrite::CloseDelimited
        } else {
            LimitWrite::ChunkedEncoder
        };

        trace!("LimitWrite for response: {:?}", ret);

        ret
    }

    /// Replace any framing headers with the ones this mode needs.
    pub fn set_headers(
        &self,
        headers: &mut http::HeaderMap,
        content_length: Option<u64>,
        status: http::StatusCode,
    ) {
        headers.remove(http::header::TRANSFER_ENCODING);
        headers.remove(http::header::CONTENT_LENGTH);

        let no_length_allowed =
            status.is_informational() || status == http::StatusCode::NO_CONTENT;

        match self {
            LimitWrite::ChunkedEncoder => {
                headers.insert(
                    http::header::TRANSFER_ENCODING,
                    http::HeaderValue::from_static("chunked"),
                );
            }
            LimitWrite::ContentLength(w) => {
                headers.insert(http::header::CONTENT_LENGTH, w.limit.into());
            }
            LimitWrite::CloseDelimited => {}
            LimitWrite::NoBody => {
                // HEAD and 304 keep the length the body would have had.
                if let (false, Some(len)) = (no_length_allowed, content_length) {
                    headers.insert(http::header::CONTENT_LENGTH, len.into());
                }
            }
        }
    }

    pub fn is_no_body(&self) -> bool {
        matches!(self, LimitWrite::NoBody)
    }

    pub fn is_close_delimited(&self) -> bool {
        matches!(self, LimitWrite::CloseDelimited)
    }

    /// Account for `len` bytes about to be written.
    pub fn accept(&mut self, len: usize) -> Result<(), Error> {
        match self {
            LimitWrite::ContentLength(v) => v.accept(len),
            LimitWrite::NoBody if len > 0 => {
                Err(Error::User("Body data is not expected for this response".into()))
            }
            _ => Ok(()),
        }
    }

    /// Frame some already accepted data into `out`.
    pub fn write(&self, data: &[u8], out: &mut BytesMut) {
        match self {
            LimitWrite::ChunkedEncoder => ChunkedEncoder::write_chunk(data, out),
            LimitWrite::ContentLength(_) | LimitWrite::CloseDelimited => {
                out.extend_from_slice(data)
            }
            LimitWrite::NoBody => {}
        }
    }

    /// Finish up writing, called once after the all `write()` calls are done.
    pub fn finish(&self, out: &mut BytesMut) -> Result<(), Error> {
        match self {
            LimitWrite::ChunkedEncoder => {
                ChunkedEncoder::write_finish(out);
                Ok(())
            }
            LimitWrite::ContentLength(v) => v.finish(),
            LimitWrite::CloseDelimited | LimitWrite::NoBody => Ok(()),
        }
    }
}

/// Limit write by length.
#[derive(Debug)]
pub(crate) struct ContentLengthWrite {
    limit: u64,
    total: u64,
}

impl ContentLengthWrite {
    fn new(limit: u64) -> Self {
        ContentLengthWrite { limit, total: 0 }
    }

    fn accept(&mut self, len: usize) -> Result<(), Error> {
        let total = self.total + len as u64;

        if total > self.limit {
            let m = format!(
                "Body data longer than content-length header: {} > {}",
                total, self.limit
            );
            return Err(Error::User(m));
        }

        self.total = total;

        Ok(())
    }

    fn finish(&self) -> Result<(), Error> {
        if self.total < self.limit {
            let m = format!(
                "Body data shorter than content-length header: {} < {}",
                self.total, self.limit
            );
            return Err(Error::User(m));
        }
        Ok(())
    }
}

impl fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self {
            LimitRead::ChunkedDecoder(_) => write!(f, "ChunkedDecoder")?,
            LimitRead::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitRead::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

impl fmt::Debug for LimitWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitWrite::ChunkedEncoder => write!(f, "ChunkedEncoder")?,
            LimitWrite::ContentLength(l) => write!(f, "ContentLength({})", l.limit)?,
            LimitWrite::CloseDelimited => write!(f, "CloseDelimited")?,
            LimitWrite::NoBody => write!(f, "NoBody")?,
        }
        Ok(())
    }
}

fn is_chunked(headers: &http::HeaderMap<http::HeaderValue>) -> bool {
    headers
        .get("transfer-encoding")
        .and_then(|h| h.to_str().ok())
        // https://tools.ietf.org/html/rfc2616#section-4.4
        //
        // If a Transfer-Encoding header field (section 14.41) is present and
        // has any value other than "identity", then the transfer-length is
        // defined by use of the "chunked" transfer-coding
        .map(|h| !h.contains("identity"))
        .unwrap_or(false)
}

/// Whether the connection may carry another request after this one.
pub(crate) fn allow_reuse(
    headers: &http::HeaderMap<http::HeaderValue>,
    version: http::Version,
) -> bool {
    if version == http::Version::HTTP_11 {
        is_keep_alive(headers, true)
    } else {
        is_keep_alive(headers, false)
    }
}

fn is_keep_alive(headers: &http::HeaderMap<http::HeaderValue>, default: bool) -> bool {
    headers
        .get("connection")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            if h.eq_ignore_ascii_case("keep-alive") {
                Some(true)
            } else if h.eq_ignore_ascii_case("close") {
                Some(false)
            } else {
                None
            }
        })
        .unwrap_or(default)
}

/// Whether the request asks for an interim `100 Continue` before sending its body.
pub(crate) fn expects_continue(
    headers: &http::HeaderMap<http::HeaderValue>,
    version: http::Version,
) -> bool {
    // https://tools.ietf.org/html/rfc7231#section-5.1.1
    // A server that receives a 100-continue expectation in an HTTP/1.0
    // request MUST ignore that expectation.
    version == http::Version::HTTP_11
        && get_str(headers, "expect")
            .map(|v| v.eq_ignore_ascii_case("100-continue"))
            .unwrap_or(false)
}

fn get_str<'a>(headers: &'a http::HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

#[cfg(test)]
mod test {
    use super::*;
    use http::{HeaderMap, StatusCode, Version};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(*k, v.parse().unwrap());
        }
        h
    }

    #[test]
    fn read_kind_from_headers() {
        let k = |p: &[(&'static str, &'static str)]| LimitRead::from_headers(&headers(p)).unwrap().kind();
        assert_eq!(k(&[]), BodyKind::Empty);
        assert_eq!(k(&[("content-length", "0")]), BodyKind::Empty);
        assert_eq!(k(&[("content-length", "12")]), BodyKind::Length(12));
        assert_eq!(
            k(&[("content-length", "12"), ("transfer-encoding", "chunked")]),
            BodyKind::Chunked
        );
        assert!(LimitRead::from_headers(&headers(&[("content-length", "x")])).is_err());
    }

    #[test]
    fn content_length_read_stops_at_limit() {
        let mut limit = LimitRead::from_headers(&headers(&[("content-length", "3")])).unwrap();
        let mut buf = BytesMut::from(&b"abcdef"[..]);
        assert_eq!(&limit.decode(&mut buf).unwrap().unwrap()[..], b"abc");
        assert!(limit.is_complete());
        assert!(limit.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"def");
    }

    #[test]
    fn write_modes() {
        let v11 = Version::HTTP_11;
        let ok = StatusCode::OK;
        assert!(matches!(
            LimitWrite::for_response(None, ok, v11, false),
            LimitWrite::ChunkedEncoder
        ));
        assert!(LimitWrite::for_response(Some(0), ok, v11, false).is_no_body());
        assert!(matches!(
            LimitWrite::for_response(Some(5), ok, v11, false),
            LimitWrite::ContentLength(_)
        ));
        assert!(LimitWrite::for_response(Some(5), ok, v11, true).is_no_body());
        assert!(LimitWrite::for_response(None, StatusCode::NO_CONTENT, v11, false).is_no_body());
        assert!(LimitWrite::for_response(None, ok, Version::HTTP_10, false).is_close_delimited());
    }

    #[test]
    fn framing_headers_replaced() {
        let mut h = headers(&[("content-length", "99"), ("x-failure-id", "abc")]);
        let limit = LimitWrite::for_response(None, StatusCode::OK, Version::HTTP_11, false);
        limit.set_headers(&mut h, None, StatusCode::OK);
        assert!(h.get("content-length").is_none());
        assert_eq!(h["transfer-encoding"], "chunked");
        assert_eq!(h["x-failure-id"], "abc");

        let mut h = HeaderMap::new();
        let limit = LimitWrite::for_response(Some(7), StatusCode::OK, Version::HTTP_11, true);
        limit.set_headers(&mut h, Some(7), StatusCode::OK);
        assert_eq!(h["content-length"], "7");
    }

    #[test]
    fn content_length_write_enforced() {
        let mut limit = LimitWrite::for_response(Some(3), StatusCode::OK, Version::HTTP_11, false);
        limit.accept(2).unwrap();
        assert!(limit.accept(2).is_err());
        let mut out = BytesMut::new();
        assert!(limit.finish(&mut out).is_err());
        limit.accept(1).unwrap();
        limit.finish(&mut out).unwrap();
    }

    #[test]
    fn no_body_rejects_data() {
        let mut limit = LimitWrite::for_response(Some(0), StatusCode::OK, Version::HTTP_11, false);
        assert!(limit.accept(0).is_ok());
        assert!(limit.accept(1).is_err());
    }

    #[test]
    fn keep_alive_rules() {
        assert!(allow_reuse(&headers(&[]), Version::HTTP_11));
        assert!(!allow_reuse(&headers(&[("connection", "close")]), Version::HTTP_11));
        assert!(!allow_reuse(&headers(&[]), Version::HTTP_10));
        assert!(allow_reuse(&headers(&[("connection", "Keep-Alive")]), Version::HTTP_10));
    }

    #[test]
    fn expect_continue_rules() {
        let h = headers(&[("expect", "100-continue")]);
        assert!(expects_continue(&h, Version::HTTP_11));
        assert!(!expects_continue(&h, Version::HTTP_10));
        assert!(!expects_continue(&headers(&[]), Version::HTTP_11));
    }
}
