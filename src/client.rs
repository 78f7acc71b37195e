//! Client side of the HTTP/1.1 protocol.
//!
//! # Example
//!
//! ```rust, no_run
//! use ferry_h1::client::Client;
//! use tokio::io::AsyncReadExt;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ferry_h1::Error> {
//!     let client = Client::new();
//!
//!     let req = http::Request::get("http://example.com/path")
//!         .body(Vec::new())
//!         .unwrap();
//!
//!     let res = client.send(req).await?;
//!     println!("status: {}", res.status());
//!
//!     // Reading the body to the end hands the connection back
//!     // to the pool for the next request.
//!     let mut body = res.into_body();
//!     let mut text = Vec::new();
//!     body.read_to_end(&mut text).await?;
//!
//!     Ok(())
//! }
//! ```

use crate::body::Body;
use crate::error::excerpt;
use crate::http11::{self, Reason, ResponseHead};
use crate::limit::{self, LimitWrite};
use crate::pool::{Checkout, Pool};
use crate::Error;
use http::header::{HeaderMap, CONTENT_LENGTH, HOST};
use http::{Method, StatusCode, Version};
use std::io::Write;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use url::Url;

/// Redirect chains stop after this many requests.
const MAX_REDIRECTS: usize = 10;

/// Buffer size when writing a request head.
const WRITE_BUF_INIT_SIZE: usize = 8192;

/// HTTP/1.1 client on top of a connection pool.
///
/// One exchange runs per connection at a time; the response [`Body`]
/// returns the connection to the pool once it has been read to the end.
/// Redirects are followed up to 10 hops, and the optional timeout is a
/// wall-clock deadline over the entire chain.
#[derive(Debug)]
pub struct Client {
    pool: Pool,
    timeout: Option<Duration>,
}

impl Client {
    pub fn new() -> Client {
        Client::with_pool(Pool::default())
    }

    pub fn with_pool(pool: Pool) -> Client {
        Client {
            pool,
            timeout: None,
        }
    }

    /// Wall-clock budget for a whole `send`, including redirects and the
    /// body. A fired deadline abandons the request and closes the
    /// connection it was using.
    pub fn timeout(mut self, timeout: Duration) -> Client {
        self.timeout = Some(timeout);
        self
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    /// Send a request, following redirects, and return the response with
    /// a streaming body.
    ///
    /// Only `http` URLs are supported. The request body is owned bytes so
    /// 307/308 redirects can re-send it.
    pub async fn send(&self, req: http::Request<Vec<u8>>) -> Result<http::Response<Body>, Error> {
        let deadline = self.timeout.map(|t| Instant::now() + t);

        let (parts, original_body) = req.into_parts();

        let original_url = parse_url(&parts.uri)?;
        let original_headers = parts.headers;

        let mut method = parts.method;
        let mut url = original_url.clone();
        let mut include_body = true;
        let mut sent = 0;

        loop {
            let mut headers = original_headers.clone();
            if sent > 0 {
                // the Host on a redirected hop comes from the new url.
                headers.remove(HOST);
                if url.host_str() != original_url.host_str() {
                    strip_sensitive(&mut headers);
                }
            }

            let body = if include_body {
                &original_body[..]
            } else {
                // a hop that drops the body drops its framing too.
                headers.remove(CONTENT_LENGTH);
                &[][..]
            };

            sent += 1;
            let res = self.exchange(&method, &url, &headers, body, deadline).await?;

            let (next_method, resend_body) = match redirect_method(&method, res.status()) {
                Some(v) => v,
                None => return Ok(res),
            };

            let location = match limit::get_str(res.headers(), "location") {
                Some(l) => l.to_string(),
                // nowhere to go, the redirect is the final answer.
                None => return Ok(res),
            };

            if sent >= MAX_REDIRECTS {
                return Err(Error::TooManyRedirects);
            }

            let status = res.status();

            // drain the hop's body so its connection goes back to the pool.
            drain(res.into_body()).await;

            let next = url
                .join(&location)
                .map_err(|_| Error::MalformedHeader(excerpt(location.as_bytes())))?;
            if next.scheme() != "http" {
                return Err(Error::UnsupportedScheme(next.scheme().to_string()));
            }

            debug!("redirect {}: {} -> {}", status, url, next);

            method = next_method;
            include_body = resend_body;
            url = next;
        }
    }

    async fn exchange(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
        deadline: Option<Instant>,
    ) -> Result<http::Response<Body>, Error> {
        let key = canonical_addr(url)?;

        // a declared content-length must agree with the body we hold.
        if let Some(declared) = limit::get_as::<u64>(headers, "content-length") {
            if declared != body.len() as u64 {
                return Err(Error::ShortBody {
                    written: body.len() as u64,
                    expected: declared,
                });
            }
        }

        let head_phase = self.head_phase(&key, method, url, headers, body, deadline);

        let (conn, head) = match deadline {
            Some(d) => match timeout_at(d, head_phase).await {
                Ok(r) => r?,
                Err(_) => {
                    // dropping the phase future dropped its checkout,
                    // which closed the connection.
                    debug!("deadline fired before the response head");
                    return Err(Error::DeadlineExceeded);
                }
            },
            None => head_phase.await?,
        };

        let body = Body::new(conn, head.limit, head.close, deadline);

        let mut res = http::Response::new(body);
        *res.status_mut() = head.status;
        *res.version_mut() = head.version;
        *res.headers_mut() = head.headers;
        res.extensions_mut().insert(Reason(head.reason));

        Ok(res)
    }

    /// Acquire a connection, write the request and parse the response
    /// head. Any error leaves the checkout to be dropped, closing the
    /// connection rather than releasing it.
    async fn head_phase(
        &self,
        key: &str,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: &[u8],
        deadline: Option<Instant>,
    ) -> Result<(Checkout, ResponseHead), Error> {
        let mut conn = self.pool.acquire(key, deadline).await?;

        let framing = if body.is_empty() && !headers.contains_key(CONTENT_LENGTH) {
            LimitWrite::NoBody
        } else {
            LimitWrite::content_length(body.len() as u64)
        };

        let mut buf = Vec::with_capacity(WRITE_BUF_INIT_SIZE);

        http11::write_request_line(&mut buf, method.as_str(), &request_target(url), Version::HTTP_11)?;

        if !headers.contains_key(HOST) {
            write!(buf, "Host: {}\r\n", host_header(url))?;
        }

        http11::write_headers(&mut buf, headers, &framing, false)?;

        trace!(
            "write request ({}): {:?}",
            conn.id(),
            String::from_utf8_lossy(&buf)
        );

        let io = conn.io_mut();
        io.write_all(&buf).await?;
        if !body.is_empty() {
            io.write_all(body).await?;
        }
        io.flush().await?;

        let head = http11::read_response_head(conn.io_mut(), method == Method::HEAD).await?;

        Ok((conn, head))
    }
}

impl Default for Client {
    fn default() -> Self {
        Client::new()
    }
}

fn parse_url(uri: &http::Uri) -> Result<Url, Error> {
    let raw = uri.to_string();
    let url = Url::parse(&raw).map_err(|_| Error::UnsupportedScheme(excerpt(raw.as_bytes())))?;
    if url.scheme() != "http" {
        return Err(Error::UnsupportedScheme(url.scheme().to_string()));
    }
    if url.host_str().is_none() {
        return Err(Error::MissingHost);
    }
    Ok(url)
}

/// Pool key for a url: IDNA-ascii host (the url crate normalizes at
/// parse) plus the explicit or scheme-default port.
fn canonical_addr(url: &Url) -> Result<String, Error> {
    let host = url.host_str().ok_or(Error::MissingHost)?;
    let port = url.port_or_known_default().unwrap_or(80);
    Ok(format!("{}:{}", host, port))
}

/// Path and query part for the request line.
fn request_target(url: &Url) -> String {
    let mut target = url.path().to_string();
    if target.is_empty() {
        target.push('/');
    }
    if let Some(q) = url.query() {
        target.push('?');
        target.push_str(q);
    }
    target
}

/// Host header value, eliding the default port.
fn host_header(url: &Url) -> String {
    let host = url.host_str().unwrap_or("");
    match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    }
}

/// What an automatic redirect does to the request method, and whether
/// the original body travels along. Not a latch: derived fresh from the
/// status code of every hop.
fn redirect_method(method: &Method, status: StatusCode) -> Option<(Method, bool)> {
    match status.as_u16() {
        301 | 302 | 303 => {
            // the hop may only be made without user interaction if the
            // second request is GET or HEAD.
            let next = if method == Method::GET || method == Method::HEAD {
                method.clone()
            } else {
                Method::GET
            };
            Some((next, false))
        }
        307 | 308 => Some((method.clone(), true)),
        _ => None,
    }
}

fn strip_sensitive(headers: &mut HeaderMap) {
    for name in ["authorization", "cookie", "cookie2", "www-authenticate"] {
        headers.remove(name);
    }
}

async fn drain(mut body: Body) {
    let mut sink = [0u8; 8192];
    loop {
        match body.read(&mut sink).await {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                trace!("drain of redirect body failed: {}", e);
                break;
            }
        }
    }
}
