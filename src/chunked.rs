//! `Transfer-Encoding: chunked` decoding and encoding.
//!
//! The decoder is incremental: it consumes whatever is buffered and keeps its
//! position between calls, so chunk boundaries may fall anywhere in the
//! stream of reads.

use crate::Error;
use bytes::{Buf, Bytes, BytesMut};
use std::io::Write;

/// Longest chunk size line we accept (hex digits, not counting extensions).
const MAX_SIZE_DIGITS: usize = 16;

/// Longest trailer line (or chunk extension) we are willing to skip.
const MAX_LINE: usize = 8192;

#[derive(Debug)]
pub(crate) struct ChunkedDecoder {
    state: DecoderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Reading hex digits of the chunk size.
    Size { size: u64, digits: usize },
    /// Skipping `;ext=val` until end of line.
    Extension { size: u64, skipped: usize },
    /// Got `\r` after the size line, expecting `\n`.
    SizeLf { size: u64 },
    /// Chunk data with bytes left.
    Data(u64),
    /// Expecting `\r\n` after the chunk data.
    DataCr,
    DataLf,
    /// Trailer section after the last chunk. `len` is the current line length.
    Trailer { len: usize },
    End,
}

impl ChunkedDecoder {
    pub fn new() -> Self {
        ChunkedDecoder {
            state: DecoderState::Size { size: 0, digits: 0 },
        }
    }

    pub fn is_end(&self) -> bool {
        self.state == DecoderState::End
    }

    /// Decode some chunk data from the buffer.
    ///
    /// Returns `None` if the buffer must be topped up before any more data can be
    /// produced, or if the end is reached (check `is_end()`).
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, Error> {
        use DecoderState::*;

        loop {
            if let Data(left) = self.state {
                if buf.is_empty() {
                    return Ok(None);
                }
                let take = (left.min(buf.len() as u64)) as usize;
                let data = buf.split_to(take).freeze();
                let left = left - take as u64;
                self.state = if left == 0 { DataCr } else { Data(left) };
                return Ok(Some(data));
            }

            if self.state == End || buf.is_empty() {
                return Ok(None);
            }

            let c = buf[0];
            buf.advance(1);

            self.state = match self.state {
                Size { size, digits } => match c {
                    b'0'..=b'9' | b'a'..=b'f' | b'A'..=b'F' => {
                        if digits == MAX_SIZE_DIGITS {
                            return Err(Error::Protocol("Chunk size too large".into()));
                        }
                        let v = (c as char).to_digit(16).unwrap_or(0) as u64;
                        Size {
                            size: size * 16 + v,
                            digits: digits + 1,
                        }
                    }
                    b';' | b' ' | b'\t' if digits > 0 => Extension { size, skipped: 0 },
                    b'\r' if digits > 0 => SizeLf { size },
                    b'\n' if digits > 0 => after_size(size),
                    _ => {
                        return Err(Error::Protocol(format!(
                            "Unexpected char in chunk size: {:?}",
                            c as char
                        )))
                    }
                },
                Extension { size, skipped } => match c {
                    b'\r' => SizeLf { size },
                    b'\n' => after_size(size),
                    _ if skipped == MAX_LINE => {
                        return Err(Error::Protocol("Chunk extension too long".into()));
                    }
                    _ => Extension {
                        size,
                        skipped: skipped + 1,
                    },
                },
                SizeLf { size } => {
                    if c != b'\n' {
                        return Err(Error::Protocol("Expected LF after chunk size".into()));
                    }
                    after_size(size)
                }
                DataCr => match c {
                    b'\r' => DataLf,
                    // be lenient with bare LF line endings
                    b'\n' => Size { size: 0, digits: 0 },
                    _ => return Err(Error::Protocol("Expected CRLF after chunk data".into())),
                },
                DataLf => {
                    if c != b'\n' {
                        return Err(Error::Protocol("Expected LF after chunk data".into()));
                    }
                    Size { size: 0, digits: 0 }
                }
                Trailer { len } => match c {
                    b'\r' => Trailer { len },
                    b'\n' if len == 0 => End,
                    b'\n' => Trailer { len: 0 },
                    _ if len == MAX_LINE => {
                        return Err(Error::Protocol("Trailer line too long".into()));
                    }
                    _ => Trailer { len: len + 1 },
                },
                Data(_) | End => unreachable!("handled above"),
            };

            if self.state == End {
                trace!("Chunked decoder reached end");
            }
        }
    }
}

fn after_size(size: u64) -> DecoderState {
    if size == 0 {
        DecoderState::Trailer { len: 0 }
    } else {
        DecoderState::Data(size)
    }
}

pub(crate) struct ChunkedEncoder;

impl ChunkedEncoder {
    /// Encode one chunk. Empty data is skipped since a zero sized chunk
    /// would terminate the body.
    pub fn write_chunk(data: &[u8], out: &mut BytesMut) {
        if data.is_empty() {
            return;
        }
        let mut header = [0_u8; 20];
        let mut cur = std::io::Cursor::new(&mut header[..]);
        // 16 hex digits + CRLF fits
        let _ = write!(cur, "{:x}\r\n", data.len());
        let n = cur.position() as usize;

        out.reserve(n + data.len() + 2);
        out.extend_from_slice(&header[..n]);
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }

    pub fn write_finish(out: &mut BytesMut) {
        out.extend_from_slice(b"0\r\n\r\n");
    }
}
