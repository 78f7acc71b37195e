use std::fmt;
use std::io;

/// Possible errors from this crate.
///
/// Parse errors are fatal to the message being read, and the connection
/// they occurred on is closed rather than reused. Variants carry the
/// offending input truncated to 64 bytes where that is safe to echo.
#[derive(Debug)]
pub enum Error {
    /// Request or status line that doesn't split into its parts.
    MalformedStart(String),
    /// A version that isn't exactly `HTTP/1.0` or `HTTP/1.1`.
    BadVersion(String),
    /// Header line without a key, with an invalid name, or obsolete folding.
    MalformedHeader(String),
    /// A single line exceeded 4096 bytes before the line feed.
    LineTooLong,
    /// HTTP/1.1 request with neither URL authority nor `Host` header.
    MissingHost,
    /// Only `http` is supported.
    UnsupportedScheme(String),
    /// Method contains non-token bytes.
    InvalidMethod(String),
    /// Multiple `Content-Length` headers that do not agree.
    ConflictingContentLength,
    /// `Content-Length` that is empty, non-numeric or out of range.
    BadContentLength(String),
    /// Any `Transfer-Encoding` other than a single `chunked` token.
    UnsupportedTransferEncoding(String),
    /// Bad chunk-size line or missing CRLF after chunk data.
    MalformedChunk,
    /// Trailer name that is forbidden or was not declared in `Trailer`.
    BadTrailer(String),
    /// The peer hung up in the middle of a message.
    UnexpectedEof,
    /// Body length does not match the declared `Content-Length`.
    ShortBody { written: u64, expected: u64 },
    /// More than 10 redirect hops.
    TooManyRedirects,
    /// The wall-clock deadline fired; the connection has been closed.
    DeadlineExceeded,
    /// A wrapped std::io::Error from the underlying transport (socket).
    Io(io::Error),
}

/// Cap on offending input echoed back in errors, so a hostile peer can't
/// make us carry arbitrary amounts of it around.
const MAX_EXCERPT: usize = 64;

pub(crate) fn excerpt(bytes: &[u8]) -> String {
    let cut = bytes.len().min(MAX_EXCERPT);
    let mut s = String::from_utf8_lossy(&bytes[..cut]).into_owned();
    if bytes.len() > MAX_EXCERPT {
        s.push_str("...");
    }
    s
}

impl Error {
    /// The io::ErrorKind used when this error crosses an `AsyncRead`
    /// surface such as a body reader.
    pub(crate) fn io_kind(&self) -> io::ErrorKind {
        match self {
            Error::UnexpectedEof => io::ErrorKind::UnexpectedEof,
            Error::DeadlineExceeded => io::ErrorKind::TimedOut,
            Error::Io(e) => e.kind(),
            _ => io::ErrorKind::InvalidData,
        }
    }

    pub(crate) fn into_io(self) -> io::Error {
        match self {
            Error::Io(e) => e,
            other => io::Error::new(other.io_kind(), other),
        }
    }

    /// Recover an `Error` that has round-tripped through `io::Error`,
    /// e.g. out of a body read.
    pub fn from_io(e: io::Error) -> Error {
        let wrapped = e.get_ref().map(|r| r.is::<Error>()).unwrap_or(false);
        if !wrapped {
            return Error::Io(e);
        }
        match e.into_inner() {
            Some(inner) => match inner.downcast::<Error>() {
                Ok(b) => *b,
                Err(e) => Error::Io(io::Error::new(io::ErrorKind::Other, e)),
            },
            // invariant: get_ref() said there is an inner error.
            None => unreachable!("io error lost its inner"),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::MalformedStart(v) => write!(f, "malformed start line: {:?}", v),
            Error::BadVersion(v) => write!(f, "bad http version: {:?}", v),
            Error::MalformedHeader(v) => write!(f, "malformed header: {:?}", v),
            Error::LineTooLong => write!(f, "line longer than 4096 bytes"),
            Error::MissingHost => write!(f, "http/1.1 request without a host"),
            Error::UnsupportedScheme(v) => write!(f, "unsupported scheme: {:?}", v),
            Error::InvalidMethod(v) => write!(f, "invalid method: {:?}", v),
            Error::ConflictingContentLength => write!(f, "conflicting content-length values"),
            Error::BadContentLength(v) => write!(f, "bad content-length: {:?}", v),
            Error::UnsupportedTransferEncoding(v) => {
                write!(f, "unsupported transfer-encoding: {:?}", v)
            }
            Error::MalformedChunk => write!(f, "malformed chunk"),
            Error::BadTrailer(v) => write!(f, "bad trailer: {:?}", v),
            Error::UnexpectedEof => write!(f, "unexpected eof"),
            Error::ShortBody { written, expected } => write!(
                f,
                "body is {} bytes, content-length said {}",
                written, expected
            ),
            Error::TooManyRedirects => write!(f, "stopped after 10 redirects"),
            Error::DeadlineExceeded => write!(f, "deadline exceeded"),
            Error::Io(v) => fmt::Display::fmt(v, f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        // Don't double-wrap our own errors coming back out of a reader.
        Error::from_io(e)
    }
}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        e.into_io()
    }
}
