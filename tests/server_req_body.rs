use ferry_h1::server::{self, Handler, RecvBody, ResponseSink};
use ferry_h1::Error;
use std::future::Future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

mod common;

struct Echo;

impl Handler for Echo {
    fn handle(
        &mut self,
        req: http::Request<RecvBody<'_>>,
        respond: &mut ResponseSink<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let mut body = req.into_body();

            let mut v = Vec::new();
            body.read_to_end(&mut v).await?;

            respond.write(&v).await?;
            Ok(())
        }
    }
}

#[tokio::test]
async fn echo_content_length_body() {
    common::setup_logger();

    let (mut client, server_io) = tokio::io::duplex(16_384);
    let srv = tokio::spawn(server::serve(server_io, Echo));

    client
        .write_all(b"POST /echo HTTP/1.1\r\nHost: test\r\nContent-Length: 5\r\n\r\nhello")
        .await
        .unwrap();

    let (head, body) = common::read_raw_response(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", head);
    assert_eq!(body, b"hello");

    drop(client);
    srv.await.unwrap().unwrap();
}

#[tokio::test]
async fn echo_chunked_body() {
    common::setup_logger();

    let (mut client, server_io) = tokio::io::duplex(16_384);
    let srv = tokio::spawn(server::serve(server_io, Echo));

    client
        .write_all(
            b"POST /echo HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\n\r\n\
5\r\nHello\r\n6\r\n World\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, body) = common::read_raw_response(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", head);
    assert_eq!(body, b"Hello World");

    drop(client);
    srv.await.unwrap().unwrap();
}

struct Ignore;

impl Handler for Ignore {
    fn handle(
        &mut self,
        _req: http::Request<RecvBody<'_>>,
        respond: &mut ResponseSink<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            // never touches the request body.
            respond.write(b"ok").await?;
            Ok(())
        }
    }
}

// The server drains an unread request body before the next request, so
// keep-alive survives handlers that don't care about the body.
#[tokio::test]
async fn unread_body_is_drained_between_requests() {
    common::setup_logger();

    let (mut client, server_io) = tokio::io::duplex(16_384);
    let srv = tokio::spawn(server::serve(server_io, Ignore));

    for _ in 0..2 {
        client
            .write_all(b"POST /drop HTTP/1.1\r\nHost: test\r\nContent-Length: 11\r\n\r\nignore this")
            .await
            .unwrap();

        let (head, body) = common::read_raw_response(&mut client).await.unwrap();
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", head);
        assert_eq!(body, b"ok");
    }

    drop(client);
    srv.await.unwrap().unwrap();
}

struct WantsTrailers;

impl Handler for WantsTrailers {
    fn handle(
        &mut self,
        req: http::Request<RecvBody<'_>>,
        respond: &mut ResponseSink<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            let mut body = req.into_body();

            let mut v = Vec::new();
            body.read_to_end(&mut v).await?;
            assert_eq!(v, b"Hello");

            let trailers = body.trailers().expect("trailers after drain");
            assert_eq!(trailers.get("x-checksum").unwrap(), "abc123");

            respond.write(b"ok").await?;
            Ok(())
        }
    }
}

#[tokio::test]
async fn chunked_request_trailers() {
    common::setup_logger();

    let (mut client, server_io) = tokio::io::duplex(16_384);
    let srv = tokio::spawn(server::serve(server_io, WantsTrailers));

    client
        .write_all(
            b"POST /sum HTTP/1.1\r\nHost: test\r\nTransfer-Encoding: chunked\r\nTrailer: X-Checksum\r\n\r\n\
5\r\nHello\r\n0\r\nX-Checksum: abc123\r\n\r\n",
        )
        .await
        .unwrap();

    let (head, body) = common::read_raw_response(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", head);
    assert_eq!(body, b"ok");

    drop(client);
    srv.await.unwrap().unwrap();
}

struct Meta;

impl Handler for Meta {
    fn handle(
        &mut self,
        req: http::Request<RecvBody<'_>>,
        respond: &mut ResponseSink<'_>,
    ) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            assert_eq!(req.method(), http::Method::POST);
            assert_eq!(req.uri().path(), "/meta");

            let host = req.extensions().get::<server::Host>().expect("host");
            assert_eq!(host.0, "test");

            let target = req.extensions().get::<server::RawTarget>().expect("target");
            assert_eq!(target.0, "/meta");

            assert_eq!(req.body().content_length(), Some(3));
            assert!(!req.body().is_chunked());

            respond.write(b"ok").await?;
            Ok(())
        }
    }
}

#[tokio::test]
async fn request_metadata_is_exposed() {
    common::setup_logger();

    let (mut client, server_io) = tokio::io::duplex(16_384);
    let srv = tokio::spawn(server::serve(server_io, Meta));

    client
        .write_all(b"POST /meta HTTP/1.1\r\nHost: test\r\nContent-Length: 3\r\n\r\nabc")
        .await
        .unwrap();

    let (head, body) = common::read_raw_response(&mut client).await.unwrap();
    assert!(head.starts_with("HTTP/1.1 200 OK\r\n"), "{:?}", head);
    assert_eq!(body, b"ok");

    drop(client);
    srv.await.unwrap().unwrap();
}
