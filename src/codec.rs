//! Streaming decoder turning connection bytes into message events.
//!
//! One decoder lives for the whole connection. Each request becomes a `Head`,
//! zero or more `Data` and exactly one `End`, and pipelined requests simply
//! follow each other in the same byte stream.

use crate::http11::try_parse_req;
use crate::limit::{BodyKind, LimitRead};
use crate::Error;
use bytes::{Buf, Bytes, BytesMut};
use std::fmt;

pub(crate) enum Event {
    /// Start line and headers of a new request.
    Head(http::Request<()>, BodyKind),
    /// A piece of request body.
    Data(Bytes),
    /// End of the current request.
    End,
}

pub(crate) struct Decoder {
    state: DecodeState,
    max_head: usize,
}

enum DecodeState {
    /// Expecting the next request head.
    Head,
    /// Reading the body of the current request.
    Body(LimitRead),
    /// A decode error happened, nothing more will be decoded.
    Failed,
}

impl Decoder {
    pub fn new(max_head: usize) -> Self {
        Decoder {
            state: DecodeState::Head,
            max_head,
        }
    }

    /// Between requests, i.e. the connection can end here without losing anything.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, DecodeState::Head)
    }

    /// Decode the next event from the buffer, if there is enough data for one.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Event>, Error> {
        let ret = self.try_decode(buf);
        if ret.is_err() {
            self.state = DecodeState::Failed;
        }
        ret
    }

    fn try_decode(&mut self, buf: &mut BytesMut) -> Result<Option<Event>, Error> {
        match &mut self.state {
            DecodeState::Failed => Ok(None),

            DecodeState::Head => {
                if buf.is_empty() {
                    return Ok(None);
                }

                let (req, size) = match try_parse_req(buf)? {
                    Some(v) => v,
                    None => {
                        if buf.len() > self.max_head {
                            return Err(Error::Protocol(format!(
                                "Request head larger than {} bytes",
                                self.max_head
                            )));
                        }
                        return Ok(None);
                    }
                };

                buf.advance(size);

                let limit = LimitRead::from_headers(req.headers())?;
                let kind = limit.kind();

                self.state = DecodeState::Body(limit);

                Ok(Some(Event::Head(req, kind)))
            }

            DecodeState::Body(limit) => {
                if !limit.is_complete() {
                    if let Some(data) = limit.decode(buf)? {
                        return Ok(Some(Event::Data(data)));
                    }
                }

                if limit.is_complete() {
                    trace!("Decoded end of request");
                    self.state = DecodeState::Head;
                    return Ok(Some(Event::End));
                }

                Ok(None)
            }
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Event::Head(req, kind) => write!(f, "Head({} {}, {:?})", req.method(), req.uri(), kind),
            Event::Data(b) => write!(f, "Data({})", b.len()),
            Event::End => write!(f, "End"),
        }
    }
}
