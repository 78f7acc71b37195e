use crate::Error;
use std::future::poll_fn;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Longest line we accept anywhere in a message: start lines, header
/// lines, chunk-size lines and trailer lines all share this cap.
pub const MAX_LINE_LEN: usize = 4096;

/// How much to ask the transport for per fill.
const READ_CHUNK: usize = 16_384;

/// Our own BufReader.
///
/// Buffers reads from the inner transport and hands out CRLF-delimited
/// lines on top of that buffer. Writes pass straight through so a message
/// head can be written and flushed through the same object.
///
/// Lines are terminated by LF on input, with an optional CR before it
/// that is stripped. The wire format is CRLF; tolerating a bare LF is a
/// deliberate relaxation for robustness against sloppy peers. Output
/// written by this crate is always CRLF.
#[derive(Debug)]
pub struct BufIo<R> {
    inner: R,
    buf: Vec<u8>,
    pos: usize,
}

impl<R> BufIo<R> {
    pub fn new(inner: R) -> Self {
        BufIo::with_capacity(READ_CHUNK, inner)
    }

    pub fn with_capacity(capacity: usize, inner: R) -> Self {
        BufIo {
            inner,
            buf: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Number of bytes sitting in the buffer, not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True if a complete line is already buffered, meaning a line read
    /// will not touch the transport.
    pub fn has_buffered_line(&self) -> bool {
        self.peek().contains(&b'\n')
    }

    /// The buffered bytes, without consuming them.
    pub fn peek(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    pub fn consume(&mut self, amount: usize) {
        let new_pos = self.pos + amount;

        // can't consume more than we have.
        assert!(new_pos <= self.buf.len());

        if new_pos == self.buf.len() {
            // all was consumed, reset back to start.
            self.pos = 0;
            self.buf.clear();
        } else {
            self.pos = new_pos;
        }
    }
}

impl<R> BufIo<R>
where
    R: AsyncRead + Unpin,
{
    /// Read more bytes from the transport into the buffer. Ok(0) is EOF.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<usize>> {
        let old_len = self.buf.len();
        self.buf.resize(old_len + READ_CHUNK, 0);

        let mut read_into = ReadBuf::new(&mut self.buf[old_len..]);
        let res = Pin::new(&mut self.inner).poll_read(cx, &mut read_into);

        let amount = read_into.filled().len();
        self.buf.truncate(old_len + amount);

        match res {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(())) => Poll::Ready(Ok(amount)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        }
    }

    /// Make sure at least `amount` bytes are buffered. EOF before that is
    /// an `UnexpectedEof`, since callers only ask for bytes a correct
    /// message must still contain.
    pub fn poll_want(&mut self, cx: &mut Context<'_>, amount: usize) -> Poll<io::Result<()>> {
        while self.buffered() < amount {
            let n = ready!(self.poll_fill(cx))?;
            if n == 0 {
                return Poll::Ready(Err(Error::UnexpectedEof.into_io()));
            }
        }
        Poll::Ready(Ok(()))
    }

    /// Next line with the terminator stripped.
    ///
    /// `None` means the transport reached EOF cleanly before any byte of
    /// a new line. EOF in the middle of a line is `UnexpectedEof`, and a
    /// line running past [`MAX_LINE_LEN`] before its LF is `LineTooLong`.
    pub fn poll_line(&mut self, cx: &mut Context<'_>) -> Poll<Result<Option<Vec<u8>>, Error>> {
        loop {
            if let Some(i) = self.peek().iter().position(|&b| b == b'\n') {
                if i > MAX_LINE_LEN {
                    return Poll::Ready(Err(Error::LineTooLong));
                }
                let mut line = self.buf[self.pos..self.pos + i].to_vec();
                self.consume(i + 1);
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Poll::Ready(Ok(Some(line)));
            }

            if self.buffered() > MAX_LINE_LEN {
                return Poll::Ready(Err(Error::LineTooLong));
            }

            match ready!(self.poll_fill(cx)) {
                Ok(0) => {
                    let res = if self.buffered() == 0 {
                        Ok(None)
                    } else {
                        Err(Error::UnexpectedEof)
                    };
                    return Poll::Ready(res);
                }
                Ok(_) => continue,
                Err(e) => return Poll::Ready(Err(e.into())),
            }
        }
    }

    pub async fn read_line(&mut self) -> Result<Option<Vec<u8>>, Error> {
        poll_fn(|cx| self.poll_line(cx)).await
    }

    /// Read into a plain byte slice, serving buffered bytes first.
    pub fn poll_read_into(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let has_amount = self.buffered();
        if has_amount > 0 {
            let max = buf.len().min(has_amount);
            buf[..max].copy_from_slice(&self.buf[self.pos..self.pos + max]);
            self.consume(max);
            return Poll::Ready(Ok(max));
        }

        // once the buffer is used up, read directly from the transport.
        let mut read_into = ReadBuf::new(buf);
        ready!(Pin::new(&mut self.inner).poll_read(cx, &mut read_into))?;
        Poll::Ready(Ok(read_into.filled().len()))
    }
}

impl<R> AsyncRead for BufIo<R>
where
    R: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let has_amount = this.buffered();
        if has_amount > 0 {
            let max = out.remaining().min(has_amount);
            out.put_slice(&this.buf[this.pos..this.pos + max]);
            this.consume(max);
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

// * Boilerplate proxying below **********************************

impl<R> AsyncWrite for BufIo<R>
where
    R: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}
