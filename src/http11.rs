//! Reading and writing of HTTP/1.x message heads.
//!
//! Parsing is line based on top of [`BufIo`]: start line, header lines,
//! then the framing decision that installs the right body reader. Writing
//! goes into a plain byte buffer that the caller flushes to the transport
//! in one go.

use crate::buf_reader::BufIo;
use crate::chunked::ChunkedDecoder;
use crate::error::{excerpt, Error};
use crate::limit::{self, trim_ows, LimitRead, LimitWrite};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH};
use http::{Method, StatusCode, Uri, Version};
use std::collections::HashSet;
use std::io::Write;
use tokio::io::AsyncRead;

/// Parsed request head with its body reader installed.
#[derive(Debug)]
pub struct RequestHead {
    pub method: Method,
    /// The request target exactly as it appeared on the wire.
    pub target: String,
    pub uri: Uri,
    /// URL authority if present, else the `Host` header.
    pub host: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub close: bool,
    pub limit: LimitRead,
}

/// Parsed response head with its body reader installed.
#[derive(Debug)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub reason: String,
    pub version: Version,
    pub headers: HeaderMap,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub close: bool,
    pub limit: LimitRead,
}

/// The reason phrase of a parsed response, carried in
/// `http::Response` extensions.
#[derive(Debug, Clone)]
pub struct Reason(pub String);

/// Read a request head.
///
/// `None` on clean EOF before the first byte, which is how a peer ends a
/// keep-alive connection between requests.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    io: &mut BufIo<R>,
) -> Result<Option<RequestHead>, Error> {
    let line = match io.read_line().await? {
        Some(line) => line,
        None => return Ok(None),
    };

    let (method, target, version) = parse_request_line(&line)?;

    let mut headers = read_headers(io).await?;

    // CONNECT uses authority-form; everything else is a request-uri.
    let just_authority = method == Method::CONNECT && !target.starts_with('/');

    let uri = if just_authority {
        Uri::builder()
            .authority(target.as_str())
            .build()
            .map_err(|_| Error::MalformedStart(excerpt(target.as_bytes())))?
    } else {
        target
            .parse::<Uri>()
            .map_err(|_| Error::MalformedStart(excerpt(target.as_bytes())))?
    };

    let mut host = uri
        .authority()
        .map(|a| a.to_string())
        .unwrap_or_default();
    if host.is_empty() {
        host = limit::get_str(&headers, "host").unwrap_or("").to_string();
    }
    if host.is_empty() && version == Version::HTTP_11 {
        return Err(Error::MissingHost);
    }

    let t = transfer(&mut headers, version)?;

    let limit = if t.chunked {
        LimitRead::Chunked(ChunkedDecoder::new(t.trailer_names))
    } else if let Some(n) = t.content_length {
        LimitRead::content_length(n)
    } else {
        // a request without explicit framing has no body.
        LimitRead::NoBody
    };

    let close = !limit::allow_reuse(&headers, version);

    let head = RequestHead {
        method,
        target,
        uri,
        host,
        version,
        headers,
        content_length: t.content_length,
        chunked: t.chunked,
        close,
        limit,
    };

    trace!("read_request_head: {:?} {:?} {:?}", head.method, head.target, head.version);

    Ok(Some(head))
}

/// Read a response head. `head_request` marks a response to a HEAD
/// request, which never carries a body regardless of its headers.
pub async fn read_response_head<R: AsyncRead + Unpin>(
    io: &mut BufIo<R>,
    head_request: bool,
) -> Result<ResponseHead, Error> {
    let line = io.read_line().await?.ok_or(Error::UnexpectedEof)?;

    let (version, status, reason) = parse_status_line(&line)?;

    let mut headers = read_headers(io).await?;

    let t = transfer(&mut headers, version)?;

    // 1xx, 204 and 304 are always terminated by the first empty line
    // after the header fields, as is any response to HEAD.
    let no_body = head_request
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED;

    let limit = if no_body {
        LimitRead::NoBody
    } else if t.chunked {
        LimitRead::Chunked(ChunkedDecoder::new(t.trailer_names))
    } else if let Some(n) = t.content_length {
        LimitRead::content_length(n)
    } else {
        // no framing at all: the body runs to connection close.
        LimitRead::ReadToEnd(crate::limit::ReadToEnd::new())
    };

    let close =
        !limit::allow_reuse(&headers, version) || matches!(limit, LimitRead::ReadToEnd(_));

    let head = ResponseHead {
        status,
        reason,
        version,
        headers,
        content_length: t.content_length,
        chunked: t.chunked,
        close,
        limit,
    };

    trace!("read_response_head: {:?} {:?}", head.status, head.version);

    Ok(head)
}

fn parse_request_line(line: &[u8]) -> Result<(Method, String, Version), Error> {
    let mut parts = line.splitn(3, |&b| b == b' ');

    let method = parts.next().unwrap_or(b"");
    let target = parts
        .next()
        .ok_or_else(|| Error::MalformedStart(excerpt(line)))?;
    let version = parts
        .next()
        .ok_or_else(|| Error::MalformedStart(excerpt(line)))?;

    let method =
        Method::from_bytes(method).map_err(|_| Error::MalformedStart(excerpt(line)))?;

    let target = String::from_utf8(target.to_vec())
        .map_err(|_| Error::MalformedStart(excerpt(line)))?;
    if target.is_empty() {
        return Err(Error::MalformedStart(excerpt(line)));
    }

    let version = parse_version(version)?;

    Ok((method, target, version))
}

fn parse_status_line(line: &[u8]) -> Result<(Version, StatusCode, String), Error> {
    let mut parts = line.splitn(3, |&b| b == b' ');

    let version = parts.next().unwrap_or(b"");
    let status = parts
        .next()
        .ok_or_else(|| Error::MalformedStart(excerpt(line)))?;

    let version = parse_version(version)?;

    // exactly three ascii digits, 100 through 599.
    if status.len() != 3 || !status.iter().all(|b| b.is_ascii_digit()) {
        return Err(Error::MalformedStart(excerpt(line)));
    }
    let code: u16 = String::from_utf8_lossy(status)
        .parse()
        .map_err(|_| Error::MalformedStart(excerpt(line)))?;
    if !(100..=599).contains(&code) {
        return Err(Error::MalformedStart(excerpt(line)));
    }
    let status =
        StatusCode::from_u16(code).map_err(|_| Error::MalformedStart(excerpt(line)))?;

    // the reason phrase is free form and may be missing entirely.
    let reason = parts
        .next()
        .map(|r| String::from_utf8_lossy(r).into_owned())
        .unwrap_or_default();

    Ok((version, status, reason))
}

fn parse_version(v: &[u8]) -> Result<Version, Error> {
    match v {
        b"HTTP/1.1" => Ok(Version::HTTP_11),
        b"HTTP/1.0" => Ok(Version::HTTP_10),
        _ => Err(Error::BadVersion(excerpt(v))),
    }
}

async fn read_headers<R: AsyncRead + Unpin>(io: &mut BufIo<R>) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();

    loop {
        let line = io.read_line().await?.ok_or(Error::UnexpectedEof)?;

        if line.is_empty() {
            break;
        }

        // obsolete line folding is not supported.
        if line[0] == b' ' || line[0] == b'\t' {
            return Err(Error::MalformedHeader(excerpt(&line)));
        }

        let colon = line
            .iter()
            .position(|&b| b == b':')
            .ok_or_else(|| Error::MalformedHeader(excerpt(&line)))?;

        let (name, rest) = line.split_at(colon);

        let name =
            HeaderName::from_bytes(name).map_err(|_| Error::MalformedHeader(excerpt(&line)))?;
        let value = HeaderValue::from_bytes(trim_ows(&rest[1..]))
            .map_err(|_| Error::MalformedHeader(excerpt(&line)))?;

        headers.append(name, value);
    }

    Ok(headers)
}

struct Transfer {
    chunked: bool,
    content_length: Option<u64>,
    trailer_names: Option<HashSet<HeaderName>>,
}

/// Resolve the framing headers, normalizing the header map as a side
/// effect (duplicate `Content-Length` collapsed, `Transfer-Encoding` and
/// `Trailer` consumed).
fn transfer(headers: &mut HeaderMap, version: Version) -> Result<Transfer, Error> {
    let chunked = limit::transfer_coding(headers, version)?;

    let mut content_length = limit::content_length(headers)?;

    if chunked {
        // chunked framing wins; a content-length next to it is dropped.
        headers.remove(CONTENT_LENGTH);
        content_length = None;
    }

    let trailer_names = limit::trailer_names(headers, chunked)?;

    Ok(Transfer {
        chunked,
        content_length,
        trailer_names,
    })
}

// * Writing below **********************************

/// Write a request line, validating the method against the token grammar.
#[allow(clippy::write_with_newline)]
pub fn write_request_line(
    buf: &mut Vec<u8>,
    method: &str,
    target: &str,
    version: Version,
) -> Result<(), Error> {
    if method.is_empty() || !method.bytes().all(is_token_byte) {
        return Err(Error::InvalidMethod(excerpt(method.as_bytes())));
    }

    write!(buf, "{} {} HTTP/{}\r\n", method, target, version_str(version))?;

    Ok(())
}

/// Write a status line. An empty reason is replaced by the standard
/// phrase for the code.
#[allow(clippy::write_with_newline)]
pub fn write_status_line(
    buf: &mut Vec<u8>,
    version: Version,
    status: StatusCode,
    reason: &str,
) -> Result<(), Error> {
    let reason = if reason.is_empty() {
        status.canonical_reason().unwrap_or("Unknown")
    } else {
        reason
    };

    write!(
        buf,
        "HTTP/{} {} {}\r\n",
        version_str(version),
        status.as_u16(),
        reason
    )?;

    Ok(())
}

/// Write the header block including the terminating blank line.
///
/// Injects `Content-Length` when the framing declares one and the caller
/// didn't set it, and `Connection: close` (once) when requested. Names go
/// out in canonical case; multiple values for a key are comma-joined
/// after trimming, and headers whose values are all empty are suppressed.
#[allow(clippy::write_with_newline)]
pub fn write_headers(
    buf: &mut Vec<u8>,
    headers: &HeaderMap,
    framing: &LimitWrite,
    close: bool,
) -> Result<(), Error> {
    if let Some(n) = framing.declared_length() {
        if !headers.contains_key(CONTENT_LENGTH) {
            write!(buf, "Content-Length: {}\r\n", n)?;
        }
    }

    if close && !limit::connection_has(headers, "close") {
        buf.extend_from_slice(b"Connection: close\r\n");
    }

    for name in headers.keys() {
        let mut joined = String::new();
        for value in headers.get_all(name) {
            let trimmed = trim_ows(value.as_bytes());
            if trimmed.is_empty() {
                continue;
            }
            if !joined.is_empty() {
                joined.push_str(", ");
            }
            joined.push_str(&String::from_utf8_lossy(trimmed));
        }
        if joined.is_empty() {
            continue;
        }

        push_canonical(buf, name.as_str());
        buf.extend_from_slice(b": ");
        buf.extend_from_slice(joined.as_bytes());
        buf.extend_from_slice(b"\r\n");
    }

    buf.extend_from_slice(b"\r\n");

    Ok(())
}

/// Canonical Mime-Header-Case: first letter of each hyphenated token
/// upper, the rest as stored (header names are lowercase internally).
fn push_canonical(buf: &mut Vec<u8>, name: &str) {
    let mut upper = true;
    for b in name.bytes() {
        if upper && b.is_ascii_lowercase() {
            buf.push(b.to_ascii_uppercase());
        } else {
            buf.push(b);
        }
        upper = b == b'-';
    }
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_10 => "1.0",
        Version::HTTP_11 => "1.1",
        _ => panic!("Unsupported http version: {:?}", version),
    }
}

pub(crate) fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
