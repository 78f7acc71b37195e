#![allow(dead_code)]

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Once;
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpListener, TcpStream};

pub fn setup_logger() {
    static START: Once = Once::new();
    START.call_once(|| {
        let test_log = std::env::var("TEST_LOG")
            .map(|x| x != "0" && x.to_lowercase() != "false")
            .unwrap_or(false);
        let level = if test_log {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Info
        };
        pretty_env_logger::formatted_builder()
            .filter_level(log::LevelFilter::Warn)
            .filter_module("ferry_h1", level)
            .target(env_logger::Target::Stdout)
            .init();
    });
}

/// A scripted test peer.
///
/// Accepts connections and reads one request head at a time, handing the
/// head and the socket to the closure, which writes whatever raw bytes
/// it wants and says whether to keep serving. Once it says stop, the
/// listener goes away and further connects are refused.
pub struct TestServer {
    pub port: u16,
}

impl TestServer {
    /// Base url for requests to this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// The pool key the client will use for this server.
    pub fn addr(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}

pub async fn serve<F, R>(mut f: F) -> io::Result<TestServer>
where
    F: FnMut(String, TcpStream, usize) -> R + Send + 'static,
    R: Future<Output = io::Result<(TcpStream, bool)>> + Send + 'static,
{
    setup_logger();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();

    tokio::spawn(async move {
        let mut count = 0;
        'outer: loop {
            let (mut tcp, _) = match listener.accept().await {
                Ok(v) => v,
                Err(_) => break,
            };

            loop {
                let head = match read_head(&mut tcp).await {
                    Some(head) => head,
                    // peer closed between requests, take the next socket.
                    None => continue 'outer,
                };

                count += 1;

                let (t, keep_going) = match f(head, tcp, count).await {
                    Ok(v) => v,
                    Err(e) => panic!("test server closure failed: {}", e),
                };
                tcp = t;

                if !keep_going {
                    break 'outer;
                }
            }
        }
    });

    Ok(TestServer { port })
}

/// Read bytes up to and including the `\r\n\r\n` that ends a head.
/// `None` on EOF before any byte.
pub async fn read_head(tcp: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut one = [0_u8; 1];

    loop {
        match tcp.read(&mut one).await {
            Ok(0) => {
                if buf.is_empty() {
                    return None;
                }
                panic!("EOF in the middle of a request head");
            }
            Ok(_) => buf.push(one[0]),
            Err(_) => return None,
        }

        if buf.ends_with(b"\r\n\r\n") {
            return Some(String::from_utf8_lossy(&buf).into_owned());
        }
    }
}

/// Pull the Content-Length out of a raw head.
pub fn head_content_length(head: &str) -> Option<usize> {
    for line in head.split("\r\n") {
        let mut parts = line.splitn(2, ':');
        let name = parts.next().unwrap_or("");
        if name.eq_ignore_ascii_case("content-length") {
            return parts.next().and_then(|v| v.trim().parse().ok());
        }
    }
    None
}

/// Read a whole raw response off a socket: the head as a string plus a
/// body sized by its Content-Length (0 when there is none).
pub async fn read_raw_response<S: AsyncRead + Unpin>(io: &mut S) -> io::Result<(String, Vec<u8>)> {
    let mut buf = Vec::new();
    let mut one = [0_u8; 1];

    loop {
        let amount = io.read(&mut one).await?;
        if amount == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF before complete head",
            ));
        }
        buf.push(one[0]);
        if buf.ends_with(b"\r\n\r\n") {
            break;
        }
    }

    let head = String::from_utf8_lossy(&buf).into_owned();

    let len = head_content_length(&head).unwrap_or(0);
    let mut body = vec![0_u8; len];
    io.read_exact(&mut body).await?;

    Ok((head, body))
}

/// Reader adapter that delivers at most one byte per read, to prove that
/// parsing doesn't depend on how the stream is sliced up.
pub struct Trickle<R> {
    inner: R,
}

impl<R> Trickle<R> {
    pub fn new(inner: R) -> Self {
        Trickle { inner }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Trickle<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        let mut one = [0_u8; 1];
        let mut tmp = ReadBuf::new(&mut one);

        ready!(Pin::new(&mut this.inner).poll_read(cx, &mut tmp))?;
        out.put_slice(tmp.filled());

        Poll::Ready(Ok(()))
    }
}

/// Write all given raw bytes, then respond to the closure's satisfaction.
pub async fn write_all(tcp: &mut TcpStream, bytes: &[u8]) -> io::Result<()> {
    tcp.write_all(bytes).await?;
    tcp.flush().await
}
