use std::fmt;
use std::io;

/// Possible errors from this crate.
#[derive(Debug)]
pub enum Error {
    /// A user/usage problem such as writing more bytes than a content-length header specifies.
    User(String),
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
    /// HTTP/1.1 parse errors from the `httparse` crate.
    Http11Parser(httparse::Error),
    /// Http errors from the `http` crate.
    Http(http::Error),
    /// The exchange or connection was torn down before it could complete.
    Aborted(String),
    /// The peer broke HTTP/1.1 framing, or events arrived out of order.
    Protocol(String),
    /// Error raised by the request dispatcher.
    Dispatch(Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Wrap any error raised by application code handling a request.
    pub fn dispatch<E>(e: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        Error::Dispatch(e.into())
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(i) => i,
            Error::User(e) => io::Error::new(io::ErrorKind::Other, e),
            Error::Http11Parser(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::Http(e) => io::Error::new(io::ErrorKind::Other, e),
            Error::Aborted(e) => io::Error::new(io::ErrorKind::ConnectionAborted, e),
            Error::Protocol(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            Error::Dispatch(e) => io::Error::new(io::ErrorKind::Other, e),
        }
    }

    /// Whether this is a plain disconnect of the remote peer, which is
    /// normal operation and not worth more than a debug line.
    pub(crate) fn is_disconnect(&self) -> bool {
        match self {
            Error::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
            ),
            Error::Aborted(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::User(v) => write!(f, "{}", v),
            Error::Io(v) => fmt::Display::fmt(v, f),
            Error::Http11Parser(v) => write!(f, "http11 parser: {}", v),
            Error::Http(v) => write!(f, "http api: {}", v),
            Error::Aborted(v) => write!(f, "aborted: {}", v),
            Error::Protocol(v) => write!(f, "protocol violation: {}", v),
            Error::Dispatch(v) => write!(f, "dispatcher: {}", v),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Http11Parser(e) => Some(e),
            Error::Http(e) => Some(e),
            Error::Dispatch(e) => Some(&**e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<httparse::Error> for Error {
    fn from(e: httparse::Error) -> Self {
        Error::Http11Parser(e)
    }
}

impl From<http::Error> for Error {
    fn from(e: http::Error) -> Self {
        Error::Http(e)
    }
}
