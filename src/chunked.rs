use crate::buf_reader::BufIo;
use crate::error::{excerpt, Error};
use crate::limit::trim_ows;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::HashSet;
use std::io;
use std::task::{Context, Poll};
use tokio::io::AsyncRead;

/// Decoder for chunked transfer encoding.
///
/// Consumes the chunk framing from a [`BufIo`] and yields the decoded
/// payload. The terminal zero-size chunk and any trailer section are
/// consumed as well, so once the decoder reports end-of-body the
/// connection is positioned exactly at the start of the next message.
#[derive(Debug)]
pub struct ChunkedDecoder {
    state: State,
    /// Names declared in the `Trailer` header. Anything else arriving in
    /// the trailer section is rejected.
    allowed_trailers: Option<HashSet<HeaderName>>,
    trailers: Option<HeaderMap>,
}

#[derive(Debug, Clone, Copy)]
enum State {
    /// Read a chunk-size line, extensions stripped.
    ChunkSize,
    /// Emit up to this many bytes of chunk data to the caller.
    ChunkData(u64),
    /// Read the CRLF that terminates a chunk's data.
    ChunkCrlf,
    /// Read trailer lines until the empty line.
    Trailer,
    /// Body fully decoded.
    Done,
}

impl ChunkedDecoder {
    pub fn new(allowed_trailers: Option<HashSet<HeaderName>>) -> Self {
        ChunkedDecoder {
            state: State::ChunkSize,
            allowed_trailers,
            trailers: None,
        }
    }

    pub fn is_end(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// Trailers collected after the terminal chunk. `None` until the body
    /// is fully decoded or when no (acceptable) trailers arrived.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        if self.is_end() {
            self.trailers.take()
        } else {
            None
        }
    }

    pub fn poll_read<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        recv: &mut BufIo<R>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let mut total = 0;

        loop {
            match self.state {
                State::Done => return Poll::Ready(Ok(total)),

                State::ChunkSize => {
                    // If we already produced bytes and the size line isn't
                    // fully buffered, hand back what we have instead of
                    // blocking on the transport.
                    if total > 0 && !recv.has_buffered_line() {
                        return Poll::Ready(Ok(total));
                    }

                    let line = match recv.poll_line(cx) {
                        Poll::Pending => return ready_or_pending(total),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into_io())),
                        Poll::Ready(Ok(None)) => {
                            return Poll::Ready(Err(Error::UnexpectedEof.into_io()))
                        }
                        Poll::Ready(Ok(Some(line))) => line,
                    };

                    let size = match parse_chunk_size(&line) {
                        Ok(v) => v,
                        Err(e) => return Poll::Ready(Err(e.into_io())),
                    };

                    trace!("chunk size: {}", size);

                    self.state = if size == 0 {
                        State::Trailer
                    } else {
                        State::ChunkData(size)
                    };
                }

                State::ChunkData(left) => {
                    if total == buf.len() {
                        // caller's buffer is full.
                        return Poll::Ready(Ok(total));
                    }

                    let max = (buf.len() - total).min(left.min(usize::MAX as u64) as usize);

                    let amount = match recv.poll_read_into(cx, &mut buf[total..total + max]) {
                        Poll::Pending => return ready_or_pending(total),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(0)) => {
                            return Poll::Ready(Err(Error::UnexpectedEof.into_io()))
                        }
                        Poll::Ready(Ok(n)) => n,
                    };

                    total += amount;

                    let left = left - amount as u64;
                    self.state = if left == 0 {
                        State::ChunkCrlf
                    } else {
                        State::ChunkData(left)
                    };
                }

                State::ChunkCrlf => {
                    // Same courtesy as for the size line: don't block for
                    // the chunk terminator when we have bytes to deliver.
                    if total > 0 && recv.buffered() < 2 {
                        return Poll::Ready(Ok(total));
                    }

                    match recv.poll_want(cx, 2) {
                        Poll::Pending => return ready_or_pending(total),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                        Poll::Ready(Ok(())) => {}
                    }

                    let ok = &recv.peek()[..2] == b"\r\n";
                    recv.consume(2);
                    if !ok {
                        return Poll::Ready(Err(Error::MalformedChunk.into_io()));
                    }

                    self.state = State::ChunkSize;
                }

                State::Trailer => {
                    let line = match recv.poll_line(cx) {
                        Poll::Pending => return ready_or_pending(total),
                        Poll::Ready(Err(e)) => return Poll::Ready(Err(e.into_io())),
                        Poll::Ready(Ok(None)) => {
                            return Poll::Ready(Err(Error::UnexpectedEof.into_io()))
                        }
                        Poll::Ready(Ok(Some(line))) => line,
                    };

                    if line.is_empty() {
                        self.state = State::Done;
                        continue;
                    }

                    if let Err(e) = self.trailer_line(&line) {
                        return Poll::Ready(Err(e.into_io()));
                    }
                }
            }
        }
    }

    fn trailer_line(&mut self, line: &[u8]) -> Result<(), Error> {
        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::BadTrailer(excerpt(line)))?;

        let (name, rest) = line.split_at(colon);

        let name =
            HeaderName::from_bytes(name).map_err(|_| Error::BadTrailer(excerpt(line)))?;

        let declared = self
            .allowed_trailers
            .as_ref()
            .map(|s| s.contains(&name))
            .unwrap_or(false);
        if !declared {
            return Err(Error::BadTrailer(excerpt(name.as_str().as_bytes())));
        }

        let value = HeaderValue::from_bytes(trim_ows(&rest[1..]))
            .map_err(|_| Error::BadTrailer(excerpt(line)))?;

        self.trailers
            .get_or_insert_with(HeaderMap::new)
            .append(name, value);

        Ok(())
    }
}

/// Deliver what has been produced so far, or propagate Pending when
/// nothing has.
fn ready_or_pending(total: usize) -> Poll<io::Result<usize>> {
    if total > 0 {
        Poll::Ready(Ok(total))
    } else {
        Poll::Pending
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, Error> {
    let line = trim_ows(line);

    // chunk extensions are tolerated and dropped.
    let line = match line.iter().position(|&b| b == b';') {
        Some(i) => trim_ows(&line[..i]),
        None => line,
    };

    if line.is_empty() {
        return Err(Error::MalformedChunk);
    }

    // more than 16 hex digits can't fit the size field.
    if line.len() > 16 {
        return Err(Error::MalformedChunk);
    }

    let mut n: u64 = 0;
    for &b in line {
        let digit = match b {
            b'0'..=b'9' => b - b'0',
            b'a'..=b'f' => b - b'a' + 10,
            b'A'..=b'F' => b - b'A' + 10,
            _ => return Err(Error::MalformedChunk),
        };
        n = (n << 4) | digit as u64;
    }

    Ok(n)
}
