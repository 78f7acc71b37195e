use crate::limit::LimitRead;
use crate::pool::Checkout;
use crate::Error;
use http::HeaderMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};
use tokio::time::{Instant, Sleep};

/// A response body that owns the connection it arrives on.
///
/// Reading the body to completion releases the connection back to the
/// pool (or closes it when the exchange said `Connection: close` or had
/// no framing). Dropping the body early closes the connection, since
/// unread bytes make it unusable for another exchange.
pub struct Body {
    conn: Option<Checkout>,
    limit: LimitRead,
    close: bool,
    deadline: Option<Pin<Box<Sleep>>>,
    timed_out: bool,
    trailers: Option<HeaderMap>,
}

impl Body {
    pub(crate) fn new(
        conn: Checkout,
        limit: LimitRead,
        close: bool,
        deadline: Option<Instant>,
    ) -> Body {
        let mut body = Body {
            conn: Some(conn),
            limit,
            close,
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            timed_out: false,
            trailers: None,
        };
        // a message without a body settles the connection right away.
        body.settle();
        body
    }

    /// Size promised by `Content-Length`, when there was one.
    pub fn content_length(&self) -> Option<u64> {
        self.limit.body_size()
    }

    /// True once the body is fully read.
    pub fn is_end(&self) -> bool {
        self.limit.is_complete()
    }

    /// Trailers from a chunked body. Empty until the body has been read
    /// to completion.
    pub fn trailers(&self) -> Option<&HeaderMap> {
        self.trailers.as_ref()
    }

    /// Release or close the connection once the body is complete.
    fn settle(&mut self) {
        if !self.limit.is_complete() {
            return;
        }

        if self.trailers.is_none() {
            self.trailers = self.limit.take_trailers();
        }

        if let Some(conn) = self.conn.take() {
            if self.close || !self.limit.is_reusable() {
                conn.close();
            } else {
                trace!("body drained, releasing connection {}", conn.id());
                conn.release();
            }
        }

        self.deadline = None;
    }
}

impl AsyncRead for Body {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.timed_out {
            return Poll::Ready(Err(Error::DeadlineExceeded.into_io()));
        }

        if let Some(sleep) = &mut this.deadline {
            if sleep.as_mut().poll(cx).is_ready() {
                this.timed_out = true;
                if let Some(conn) = this.conn.take() {
                    debug!("deadline fired mid-body, closing connection {}", conn.id());
                    conn.close();
                }
                return Poll::Ready(Err(Error::DeadlineExceeded.into_io()));
            }
        }

        let conn = match &mut this.conn {
            Some(conn) => conn,
            // already settled, the body is at EOF.
            None => return Poll::Ready(Ok(())),
        };

        let buf = out.initialize_unfilled();
        if buf.is_empty() {
            return Poll::Ready(Ok(()));
        }

        match this.limit.poll_read(cx, conn.io_mut(), buf) {
            Poll::Pending => Poll::Pending,

            Poll::Ready(Ok(amount)) => {
                out.advance(amount);
                if this.limit.is_complete() {
                    this.settle();
                }
                Poll::Ready(Ok(()))
            }

            Poll::Ready(Err(e)) => {
                // errored bodies poison the connection.
                if let Some(conn) = this.conn.take() {
                    conn.close();
                }
                Poll::Ready(Err(e))
            }
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Body")
            .field("limit", &self.limit)
            .field("close", &self.close)
            .field("complete", &self.limit.is_complete())
            .finish()
    }
}
