use ferry_h1::buf_reader::BufIo;
use ferry_h1::http11::read_response_head;
use ferry_h1::Error;
use std::io::ErrorKind;
use tokio::io::AsyncRead;

mod common;

async fn read_all<R: AsyncRead + Unpin>(
    head: &mut ferry_h1::http11::ResponseHead,
    io: &mut BufIo<R>,
) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = [0_u8; 64];
    loop {
        let amount = head.limit.read(io, &mut buf).await?;
        if amount == 0 {
            break;
        }
        out.extend_from_slice(&buf[..amount]);
    }
    Ok(out)
}

#[tokio::test]
async fn chunked_echo() {
    let raw: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    assert!(head.chunked);

    let body = read_all(&mut head, &mut io).await.unwrap();
    assert_eq!(body, b"Hello World");
    assert_eq!(body.len(), 11);
    assert!(head.limit.is_complete());
    assert!(head.limit.is_reusable());
}

#[tokio::test]
async fn surplus_stays_on_the_stream() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\nSURPLUS";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let body = read_all(&mut head, &mut io).await.unwrap();
    assert_eq!(body, b"abc");

    // everything after the terminal sequence is untouched.
    use tokio::io::AsyncReadExt;
    let mut rest = Vec::new();
    io.read_to_end(&mut rest).await.unwrap();
    assert_eq!(rest, b"SURPLUS");
}

#[tokio::test]
async fn chunk_extensions_are_dropped() {
    let raw: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;name=value\r\nHello\r\n0\r\n\r\n";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let body = read_all(&mut head, &mut io).await.unwrap();
    assert_eq!(body, b"Hello");
}

#[tokio::test]
async fn declared_trailers_are_collected() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: X-Checksum\r\n\r\n\
5\r\nHello\r\n0\r\nX-Checksum: abc123\r\n\r\n";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    // the declaration itself is consumed at parse time.
    assert!(head.headers.get("trailer").is_none());

    let body = read_all(&mut head, &mut io).await.unwrap();
    assert_eq!(body, b"Hello");

    let trailers = head.limit.take_trailers().expect("trailers");
    assert_eq!(trailers.get("x-checksum").unwrap(), "abc123");
}

#[tokio::test]
async fn undeclared_trailer_is_rejected() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: X-Checksum\r\n\r\n\
5\r\nHello\r\n0\r\nX-Other: nope\r\n\r\n";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let err = read_all(&mut head, &mut io).await.expect_err("bad trailer");

    assert_eq!(err.kind(), ErrorKind::InvalidData);
    assert!(matches!(Error::from_io(err), Error::BadTrailer(_)));
}

#[tokio::test]
async fn forbidden_trailer_declaration() {
    let raw: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nTrailer: Content-Length\r\n\r\n0\r\n\r\n";
    let mut io = BufIo::new(raw);

    let err = read_response_head(&mut io, false).await.expect_err("forbidden");
    assert!(matches!(err, Error::BadTrailer(_)), "{:?}", err);
}

#[tokio::test]
async fn bad_chunk_size() {
    for tail in [&b"zz\r\nHello\r\n0\r\n\r\n"[..], &b"\r\n"[..], &b";ext\r\n"[..]] {
        let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        raw.extend_from_slice(tail);
        let mut io = BufIo::new(&raw[..]);

        let mut head = read_response_head(&mut io, false).await.unwrap();
        let err = read_all(&mut head, &mut io).await.expect_err("bad size");

        assert_eq!(err.kind(), ErrorKind::InvalidData);
        assert!(matches!(Error::from_io(err), Error::MalformedChunk));
    }
}

#[tokio::test]
async fn missing_crlf_after_chunk_data() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHelloXX0\r\n\r\n";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let err = read_all(&mut head, &mut io).await.expect_err("missing crlf");

    assert!(matches!(Error::from_io(err), Error::MalformedChunk));
}

#[tokio::test]
async fn eof_mid_chunk() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n1f\r\nHELLO";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let err = read_all(&mut head, &mut io).await.expect_err("eof");

    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn eof_instead_of_first_chunk() {
    // "HELLO" never becomes a complete chunk-size line before the close.
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nHELLO";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let err = read_all(&mut head, &mut io).await.expect_err("not chunked");

    assert_eq!(err.kind(), ErrorKind::UnexpectedEof);
}

#[tokio::test]
async fn garbage_chunk_size_line() {
    let raw: &[u8] = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nHELLO\r\n";
    let mut io = BufIo::new(raw);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let err = read_all(&mut head, &mut io).await.expect_err("bad size");

    assert!(matches!(Error::from_io(err), Error::MalformedChunk));
}

#[tokio::test]
async fn chunk_size_line_too_long() {
    let mut raw = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5;".to_vec();
    raw.extend(std::iter::repeat(b'e').take(8192));
    raw.extend_from_slice(b"\r\nHello\r\n0\r\n\r\n");
    let mut io = BufIo::new(&raw[..]);

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let err = read_all(&mut head, &mut io).await.expect_err("long line");

    assert!(matches!(Error::from_io(err), Error::LineTooLong));
}

#[tokio::test]
async fn byte_by_byte_chunked() {
    let raw: &[u8] =
        b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n";
    let mut io = BufIo::new(common::Trickle::new(raw));

    let mut head = read_response_head(&mut io, false).await.unwrap();
    let body = read_all(&mut head, &mut io).await.unwrap();

    assert_eq!(body, b"Hello World");
    assert!(head.limit.is_complete());
}
