use crate::buf_reader::BufIo;
use crate::chunked::ChunkedDecoder;
use crate::error::{excerpt, Error};
use http::header::{CONNECTION, CONTENT_LENGTH, TRAILER, TRANSFER_ENCODING};
use http::header::{HeaderMap, HeaderName};
use http::Version;
use std::collections::HashSet;
use std::fmt;
use std::future::poll_fn;
use std::io;
use std::str::FromStr;
use std::task::{ready, Context, Poll};
use tokio::io::AsyncRead;

/// Limit reading data given configuration from message headers.
pub enum LimitRead {
    /// Read from a chunked decoder. The decoder will know when there is no more
    /// data to be read.
    Chunked(ChunkedDecoder),
    /// Body data is limited by a `content-length` header.
    ContentLength(ContentLengthRead),
    /// Read until the connection closes (responses without any framing).
    ReadToEnd(ReadToEnd),
    /// No expected body.
    NoBody,
}

impl LimitRead {
    pub fn content_length(size: u64) -> Self {
        if size == 0 {
            LimitRead::NoBody
        } else {
            LimitRead::ContentLength(ContentLengthRead::new(size))
        }
    }

    pub fn is_no_body(&self) -> bool {
        match self {
            LimitRead::ContentLength(r) => r.limit == 0,
            LimitRead::NoBody => true,
            _ => false,
        }
    }

    pub fn is_complete(&self) -> bool {
        match self {
            LimitRead::Chunked(v) => v.is_end(),
            LimitRead::ContentLength(v) => v.is_end(),
            LimitRead::ReadToEnd(v) => v.is_end(),
            LimitRead::NoBody => true,
        }
    }

    /// Whether a connection that carried this body can go back in a pool.
    /// A read-to-end body by definition used up the connection.
    pub fn is_reusable(&self) -> bool {
        self.is_complete() && !self.is_read_to_end()
    }

    fn is_read_to_end(&self) -> bool {
        matches!(self, LimitRead::ReadToEnd(_))
    }

    pub fn body_size(&self) -> Option<u64> {
        if let LimitRead::ContentLength(v) = self {
            return Some(v.limit);
        }
        None
    }

    /// Trailers that arrived after a chunked body. Empty until the body
    /// has been read to completion.
    pub fn take_trailers(&mut self) -> Option<HeaderMap> {
        if let LimitRead::Chunked(v) = self {
            return v.take_trailers();
        }
        None
    }

    /// Try read some data.
    pub fn poll_read<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        recv: &mut BufIo<R>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        match self {
            LimitRead::Chunked(v) => v.poll_read(cx, recv, buf),
            LimitRead::ContentLength(v) => v.poll_read(cx, recv, buf),
            LimitRead::ReadToEnd(v) => v.poll_read(cx, recv, buf),
            LimitRead::NoBody => Poll::Ready(Ok(0)),
        }
    }

    pub async fn read<R: AsyncRead + Unpin>(
        &mut self,
        recv: &mut BufIo<R>,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        poll_fn(|cx| self.poll_read(cx, recv, buf)).await
    }
}

/// Reader limited by a set length.
#[derive(Debug)]
pub struct ContentLengthRead {
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

    fn poll_read<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        recv: &mut BufIo<R>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        let left = (self.limit - self.total).min(usize::MAX as u64) as usize;

        if left == 0 || buf.is_empty() {
            // Nothing more should be read.
            return Poll::Ready(Ok(0));
        }

        let max = buf.len().min(left);
        let amount = ready!(recv.poll_read_into(cx, &mut buf[0..max]))?;

        if amount == 0 {
            // The peer closed before delivering the promised amount. The
            // message is incomplete and the connection unusable.
            debug!(
                "partial body, received {} bytes and expected {}",
                self.total, self.limit
            );
            return Poll::Ready(Err(Error::UnexpectedEof.into_io()));
        }
        self.total += amount as u64;

        Poll::Ready(Ok(amount))
    }
}

pub struct ReadToEnd {
    reached_end: bool,
}

impl ReadToEnd {
    pub(crate) fn new() -> Self {
        ReadToEnd { reached_end: false }
    }

    fn is_end(&self) -> bool {
        self.reached_end
    }

    fn poll_read<R: AsyncRead + Unpin>(
        &mut self,
        cx: &mut Context<'_>,
        recv: &mut BufIo<R>,
        buf: &mut [u8],
    ) -> Poll<io::Result<usize>> {
        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let amount = ready!(recv.poll_read_into(cx, buf))?;

        if amount == 0 {
            self.reached_end = true;
        }

        Poll::Ready(Ok(amount))
    }
}

/// Limit writing data by a strategy configured from message headers.
///
/// This is to ensure we don't write more data than "promised" by the
/// request/response header configuration.
pub enum LimitWrite {
    /// Limit the write by the `content-length` header.
    ContentLength(ContentLengthWrite),
    /// Body framed by chunked encoding. The caller writes the chunk
    /// frames itself; this crate doesn't encode payloads.
    Chunked,
    /// There should be no body.
    NoBody,
}

impl LimitWrite {
    pub fn content_length(limit: u64) -> Self {
        LimitWrite::ContentLength(ContentLengthWrite { limit, total: 0 })
    }

    pub fn is_no_body(&self) -> bool {
        match self {
            LimitWrite::ContentLength(w) => w.limit == 0,
            LimitWrite::NoBody => true,
            _ => false,
        }
    }

    pub fn declared_length(&self) -> Option<u64> {
        if let LimitWrite::ContentLength(w) = self {
            return Some(w.limit);
        }
        None
    }

    /// Account for body data about to be written.
    pub fn record(&mut self, amount: usize) -> Result<(), Error> {
        if let LimitWrite::ContentLength(w) = self {
            w.total += amount as u64;
            if w.total > w.limit {
                return Err(Error::ShortBody {
                    written: w.total,
                    expected: w.limit,
                });
            }
        }
        Ok(())
    }

    /// Called once all writes are done.
    pub fn finish(&self) -> Result<(), Error> {
        if let LimitWrite::ContentLength(w) = self {
            if w.total != w.limit {
                return Err(Error::ShortBody {
                    written: w.total,
                    expected: w.limit,
                });
            }
        }
        Ok(())
    }
}

/// Limit write by length.
#[derive(Debug)]
pub struct ContentLengthWrite {
    limit: u64,
    total: u64,
}

impl fmt::Debug for LimitRead {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitRead::Chunked(_) => write!(f, "Chunked"),
            LimitRead::ContentLength(l) => write!(f, "ContentLength({})", l.limit),
            LimitRead::ReadToEnd(_) => write!(f, "ReadToEnd"),
            LimitRead::NoBody => write!(f, "NoBody"),
        }
    }
}

impl fmt::Debug for LimitWrite {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LimitWrite::ContentLength(l) => write!(f, "ContentLength({})", l.limit),
            LimitWrite::Chunked => write!(f, "Chunked"),
            LimitWrite::NoBody => write!(f, "NoBody"),
        }
    }
}

// * Framing-relevant header handling below **********************************

pub fn get_str<'a>(headers: &'a HeaderMap, key: &str) -> Option<&'a str> {
    headers.get(key).and_then(|v| v.to_str().ok())
}

pub fn get_as<T: FromStr>(headers: &HeaderMap, key: &str) -> Option<T> {
    get_str(headers, key).and_then(|v| v.parse().ok())
}

pub(crate) fn trim_ows(b: &[u8]) -> &[u8] {
    let mut start = 0;
    let mut end = b.len();
    while start < end && (b[start] == b' ' || b[start] == b'\t') {
        start += 1;
    }
    while end > start && (b[end - 1] == b' ' || b[end - 1] == b'\t') {
        end -= 1;
    }
    &b[start..end]
}

/// Resolve `Content-Length`, enforcing agreement between duplicates and
/// normalizing the header to a single value.
///
/// `None` means no length was declared; the caller decides what that
/// implies for the message (no body for requests, read-to-close for
/// responses).
pub fn content_length(headers: &mut HeaderMap) -> Result<Option<u64>, Error> {
    let mut values = headers
        .get_all(CONTENT_LENGTH)
        .iter()
        .map(|v| String::from_utf8_lossy(trim_ows(v.as_bytes())).into_owned());

    let first = match values.next() {
        Some(v) => v,
        None => return Ok(None),
    };

    let mut duplicates = false;
    for v in values {
        if v != first {
            return Err(Error::ConflictingContentLength);
        }
        duplicates = true;
    }

    if first.is_empty() {
        return Err(Error::BadContentLength(String::new()));
    }

    if duplicates {
        // all values agree, collapse to a single header.
        let value = first
            .parse()
            .map_err(|_| Error::BadContentLength(excerpt(first.as_bytes())))?;
        headers.insert(CONTENT_LENGTH, value);
    }

    let n: u64 = first
        .parse()
        .map_err(|_| Error::BadContentLength(excerpt(first.as_bytes())))?;

    // lengths must fit a signed 64 bit integer.
    if n >= 1 << 63 {
        return Err(Error::BadContentLength(excerpt(first.as_bytes())));
    }

    Ok(Some(n))
}

/// Resolve `Transfer-Encoding`, removing it from the headers. The only
/// coding this crate speaks is a lone `chunked`, and only on HTTP/1.1;
/// on HTTP/1.0 a (valid) chunked declaration is ignored.
pub fn transfer_coding(headers: &mut HeaderMap, version: Version) -> Result<bool, Error> {
    let values: Vec<String> = headers
        .get_all(TRANSFER_ENCODING)
        .iter()
        .map(|v| String::from_utf8_lossy(trim_ows(v.as_bytes())).into_owned())
        .collect();

    if values.is_empty() {
        return Ok(false);
    }

    headers.remove(TRANSFER_ENCODING);

    if values.len() > 1 {
        let joined = values.join(", ");
        return Err(Error::UnsupportedTransferEncoding(excerpt(
            joined.as_bytes(),
        )));
    }

    if !values[0].eq_ignore_ascii_case("chunked") {
        return Err(Error::UnsupportedTransferEncoding(excerpt(
            values[0].as_bytes(),
        )));
    }

    Ok(version >= Version::HTTP_11)
}

/// Names declared in the `Trailer` header, which is removed. Only
/// meaningful for chunked messages; a `Trailer` header without chunking
/// is left alone and ignored.
pub fn trailer_names(
    headers: &mut HeaderMap,
    chunked: bool,
) -> Result<Option<HashSet<HeaderName>>, Error> {
    if !headers.contains_key(TRAILER) || !chunked {
        return Ok(None);
    }

    let values: Vec<String> = headers
        .get_all(TRAILER)
        .iter()
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .collect();
    headers.remove(TRAILER);

    let mut names = HashSet::new();

    for v in values {
        for tok in v.split(',') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            let name = HeaderName::from_bytes(tok.as_bytes())
                .map_err(|_| Error::BadTrailer(excerpt(tok.as_bytes())))?;
            // framing headers can't be renegotiated from a trailer.
            if name == TRANSFER_ENCODING || name == TRAILER || name == CONTENT_LENGTH {
                return Err(Error::BadTrailer(excerpt(tok.as_bytes())));
            }
            names.insert(name);
        }
    }

    if names.is_empty() {
        Ok(None)
    } else {
        Ok(Some(names))
    }
}

pub fn allow_reuse(headers: &HeaderMap, version: Version) -> bool {
    if version == Version::HTTP_10 {
        is_keep_alive(headers, false)
    } else {
        is_keep_alive(headers, true)
    }
}

fn is_keep_alive(headers: &HeaderMap, default: bool) -> bool {
    if connection_has(headers, "close") {
        false
    } else if connection_has(headers, "keep-alive") {
        true
    } else {
        default
    }
}

/// Comma-aware scan of `Connection` values for a given token.
pub(crate) fn connection_has(headers: &HeaderMap, token: &str) -> bool {
    for v in headers.get_all(CONNECTION) {
        if let Ok(s) = v.to_str() {
            if s.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)) {
                return true;
            }
        }
    }
    false
}
