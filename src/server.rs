//! Server side of the HTTP/1.1 protocol.
//!
//! # Example
//!
//! ```rust, no_run
//! use ferry_h1::server;
//! use http::StatusCode;
//! use std::error::Error;
//! use tokio::net::TcpListener;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn Error>> {
//!     let listener = TcpListener::bind("127.0.0.1:3000").await?;
//!
//!     // Accept all incoming TCP connections.
//!     loop {
//!         if let Ok((socket, _peer_addr)) = listener.accept().await {
//!
//!             // Spawn a new task to process each connection individually
//!             tokio::spawn(async move {
//!                 let mut conn = server::Connection::new(socket);
//!
//!                 // Handle incoming requests from this socket, one by one.
//!                 while let Ok(Some((req, mut respond))) = conn.accept().await {
//!                     println!("received request: {} {}", req.method(), req.uri());
//!
//!                     respond.status(StatusCode::OK);
//!                     respond.write(b"Hello world!").await.unwrap();
//!                 }
//!             });
//!         }
//!     }
//! }
//! ```

use crate::buf_reader::BufIo;
use crate::http11::{self, RequestHead};
use crate::limit::{self, LimitRead, LimitWrite};
use crate::Error;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::{StatusCode, Version};
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};

/// Scratch size for draining request bodies the handler left unread.
const DRAIN_BUF_SIZE: usize = 8192;

/// Resolved host of a request (url authority, else the `Host` header),
/// carried in `http::Request` extensions.
#[derive(Debug, Clone)]
pub struct Host(pub String);

/// The request target exactly as it appeared on the wire, carried in
/// `http::Request` extensions.
#[derive(Debug, Clone)]
pub struct RawTarget(pub String);

/// Server connection for accepting incoming requests.
///
/// Each call to [`accept`][Connection::accept] finishes the previous
/// exchange (flushing the response and draining whatever of the request
/// body the handler left unread) before parsing the next request, so
/// responses always go out in request order.
pub struct Connection {
    reader: BufIo<ReadHalf<Box<dyn Io>>>,
    writer: WriteHalf<Box<dyn Io>>,
    /// Body reader for the request currently handed out.
    req_limit: LimitRead,
    sink: SinkState,
    started: bool,
    close: bool,
    done: bool,
}

impl Connection {
    pub fn new<S>(io: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(Box::new(io) as Box<dyn Io>);
        Connection {
            reader: BufIo::new(reader),
            writer,
            req_limit: LimitRead::NoBody,
            sink: SinkState::new(Version::HTTP_11, false),
            started: false,
            close: false,
            done: false,
        }
    }

    /// Next request on this connection, or `None` once it is over.
    ///
    /// EOF between requests is a clean close. Parse errors close the
    /// connection and surface once.
    pub async fn accept(
        &mut self,
    ) -> Result<Option<(http::Request<RecvBody<'_>>, ResponseSink<'_>)>, Error> {
        if self.done {
            return Ok(None);
        }

        if self.started {
            self.finish_exchange().await?;
        }

        if self.close {
            let _ = self.writer.shutdown().await;
            self.done = true;
            return Ok(None);
        }

        let head = match http11::read_request_head(&mut self.reader).await {
            Ok(Some(head)) => head,
            Ok(None) => {
                trace!("connection closed between requests");
                self.done = true;
                return Ok(None);
            }
            Err(e) => {
                self.done = true;
                return Err(e);
            }
        };

        debug!("request: {} {}", head.method, head.target);

        let RequestHead {
            method,
            target,
            uri,
            host,
            version,
            headers,
            content_length,
            chunked,
            close,
            limit,
        } = head;

        self.started = true;
        self.close = close;
        self.req_limit = limit;
        self.sink = SinkState::new(version, close);

        let Connection {
            reader,
            writer,
            req_limit,
            sink,
            ..
        } = self;

        let body = RecvBody {
            limit: req_limit,
            io: reader,
            content_length,
            chunked,
        };

        let mut req = http::Request::new(body);
        *req.method_mut() = method;
        *req.uri_mut() = uri;
        *req.version_mut() = version;
        *req.headers_mut() = headers;
        req.extensions_mut().insert(Host(host));
        req.extensions_mut().insert(RawTarget(target));

        let respond = ResponseSink {
            state: sink,
            writer,
        };

        Ok(Some((req, respond)))
    }

    /// Close the next time the current exchange finishes, even if the
    /// request and response both said keep-alive.
    pub fn set_close(&mut self) {
        self.close = true;
    }

    /// Flush the response, emitting an empty one if the handler never
    /// wrote, then drain the unread request body so the connection is
    /// positioned at the next request.
    async fn finish_exchange(&mut self) -> Result<(), Error> {
        self.sink.ensure_head(&mut self.writer, None).await?;
        self.writer.flush().await?;

        if !self.req_limit.is_complete() {
            trace!("draining unread request body");
            let mut scratch = [0u8; DRAIN_BUF_SIZE];
            loop {
                let amount = match self.req_limit.read(&mut self.reader, &mut scratch).await {
                    Ok(n) => n,
                    Err(e) => {
                        self.done = true;
                        return Err(Error::from_io(e));
                    }
                };
                if amount == 0 {
                    break;
                }
            }
        }

        if self.sink.close || limit::connection_has(&self.sink.headers, "close") {
            trace!("connection is not reusable");
            self.close = true;
        }

        self.started = false;
        Ok(())
    }
}

/// Streaming reader over the current request's body.
pub struct RecvBody<'a> {
    limit: &'a mut LimitRead,
    io: &'a mut BufIo<ReadHalf<Box<dyn Io>>>,
    content_length: Option<u64>,
    chunked: bool,
}

impl RecvBody<'_> {
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        self.chunked
    }

    pub fn is_end(&self) -> bool {
        self.limit.is_complete()
    }

    /// Trailers of a chunked request, present after the body was read to
    /// completion.
    pub fn trailers(&mut self) -> Option<HeaderMap> {
        self.limit.take_trailers()
    }
}

impl AsyncRead for RecvBody<'_> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let buf = out.initialize_unfilled();
        if buf.is_empty() {
            return Poll::Ready(Ok(()));
        }

        match this.limit.poll_read(cx, this.io, buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(amount)) => {
                out.advance(amount);
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
        }
    }
}

/// Handle to write a response for a single request.
///
/// The first `write` call implicitly sends the status line (default 200)
/// and all headers; status and header changes after that point are
/// ignored with a warning.
pub struct ResponseSink<'a> {
    state: &'a mut SinkState,
    writer: &'a mut WriteHalf<Box<dyn Io>>,
}

impl ResponseSink<'_> {
    pub fn status(&mut self, status: StatusCode) {
        if self.state.wrote_head {
            warn!("status set after the head was sent is ignored");
            return;
        }
        self.state.status = Some(status);
    }

    /// Set a response header; an empty value deletes the header.
    pub fn header(&mut self, name: &str, value: &str) {
        if self.state.wrote_head {
            warn!("header {:?} set after the head was sent is ignored", name);
            return;
        }

        let name = match HeaderName::from_bytes(name.as_bytes()) {
            Ok(name) => name,
            Err(_) => {
                warn!("invalid header name {:?}", name);
                return;
            }
        };

        if value.is_empty() {
            self.state.headers.remove(name);
            return;
        }

        match HeaderValue::from_str(value) {
            Ok(value) => {
                self.state.headers.insert(name, value);
            }
            Err(_) => {
                warn!("invalid header value for {:?}", name);
            }
        }
    }

    pub fn wrote_head(&self) -> bool {
        self.state.wrote_head
    }

    /// Close the connection once this exchange finishes.
    pub fn set_close(&mut self) {
        self.state.close = true;
    }

    /// Write body data, sending the head first if it hasn't gone out.
    ///
    /// When the handler declared no `Content-Length` and no chunked
    /// transfer, the first write's length becomes the content length.
    pub async fn write(&mut self, data: &[u8]) -> Result<usize, Error> {
        self.state
            .ensure_head(self.writer, Some(data.len()))
            .await?;

        self.state.limit.record(data.len())?;

        self.writer.write_all(data).await?;

        Ok(data.len())
    }

    pub async fn write_str(&mut self, data: &str) -> Result<usize, Error> {
        self.write(data.as_bytes()).await
    }
}

struct SinkState {
    version: Version,
    status: Option<StatusCode>,
    headers: HeaderMap,
    limit: LimitWrite,
    wrote_head: bool,
    close: bool,
}

impl SinkState {
    fn new(version: Version, close: bool) -> SinkState {
        SinkState {
            version,
            status: None,
            headers: HeaderMap::new(),
            limit: LimitWrite::NoBody,
            wrote_head: false,
            close,
        }
    }

    async fn ensure_head(
        &mut self,
        writer: &mut WriteHalf<Box<dyn Io>>,
        first_write: Option<usize>,
    ) -> Result<(), Error> {
        if self.wrote_head {
            return Ok(());
        }

        let status = self.status.unwrap_or(StatusCode::OK);

        let chunked = limit::get_str(&self.headers, "transfer-encoding")
            .map(|v| v.to_ascii_lowercase().contains("chunked"))
            .unwrap_or(false);

        let framing = if let Some(n) = limit::get_as::<u64>(&self.headers, "content-length") {
            LimitWrite::content_length(n)
        } else if chunked {
            LimitWrite::Chunked
        } else {
            LimitWrite::content_length(first_write.unwrap_or(0) as u64)
        };

        let mut buf = Vec::with_capacity(1024);
        http11::write_status_line(&mut buf, self.version, status, "")?;
        http11::write_headers(&mut buf, &self.headers, &framing, self.close)?;

        trace!("write response head: {:?}", String::from_utf8_lossy(&buf));

        writer.write_all(&buf).await?;

        self.wrote_head = true;
        self.limit = framing;

        Ok(())
    }
}

/// Something that can handle requests accepted off a connection.
pub trait Handler: Send {
    /// Handle one request. The response goes out through the sink; when
    /// nothing is written, an empty response with the sink's status
    /// (default 200) is sent after the handler returns.
    fn handle(
        &mut self,
        req: http::Request<RecvBody<'_>>,
        respond: &mut ResponseSink<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Per-connection loop: accept requests and feed them to the handler
/// until the connection is over.
///
/// Handler errors are logged; the response becomes a 500 when no head had
/// been written yet, and the connection closes.
pub async fn serve<S, H>(io: S, mut handler: H) -> Result<(), Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: Handler,
{
    let mut conn = Connection::new(io);

    loop {
        let next = match conn.accept().await {
            Ok(next) => next,
            Err(e) => {
                warn!("connection error: {}", e);
                return Err(e);
            }
        };

        match next {
            Some((req, mut respond)) => {
                if let Err(e) = handler.handle(req, &mut respond).await {
                    warn!("handler error: {}", e);
                    if !respond.wrote_head() {
                        respond.status(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    respond.set_close();
                }
            }
            None => return Ok(()),
        }
    }
}

// ***************** Boiler plate to hide IO behind a Box<dyn trait> ***************

trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<S> Io for S where S: AsyncRead + AsyncWrite + Unpin + Send {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("started", &self.started)
            .field("close", &self.close)
            .field("done", &self.done)
            .finish()
    }
}
