//! In-process HTTP peers for tests.

use std::net::SocketAddr;

use bytes::BytesMut;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
};

#[derive(Debug)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Accept a single connection, record the request, answer with `response` and close.
pub async fn serve_once(response: &'static [u8]) -> (SocketAddr, oneshot::Receiver<CapturedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = oneshot::channel();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = BytesMut::with_capacity(1024);

        let (mut captured, body_start, content_length) = loop {
            let n = stream.read_buf(&mut buffer).await.unwrap();
            assert!(n > 0, "peer closed before sending a full request head");
            let mut headers = [httparse::EMPTY_HEADER; 64];
            let mut req = httparse::Request::new(&mut headers);
            if let httparse::Status::Complete(body_start) = req.parse(&buffer).unwrap() {
                let headers: Vec<(String, String)> = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_owned(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                let content_length = headers
                    .iter()
                    .find(|(n, _)| n.eq_ignore_ascii_case("content-length"))
                    .map_or(0, |(_, v)| v.parse::<usize>().unwrap());
                let captured = CapturedRequest {
                    method: req.method.unwrap().to_owned(),
                    path: req.path.unwrap().to_owned(),
                    headers,
                    body: Vec::new(),
                };
                break (captured, body_start, content_length);
            }
        };

        while buffer.len() < body_start + content_length {
            let n = stream.read_buf(&mut buffer).await.unwrap();
            assert!(n > 0, "peer closed before sending the whole body");
        }
        captured.body = buffer[body_start..body_start + content_length].to_vec();

        stream.write_all(response).await.unwrap();
        stream.shutdown().await.unwrap();
        let _ = tx.send(captured);
    });

    (addr, rx)
}

/// Accept a single connection, answer with `response` and keep the socket open.
pub async fn serve_and_hold(response: &'static [u8]) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buffer = BytesMut::with_capacity(1024);
        while !buffer.windows(4).any(|w| w == b"\r\n\r\n") {
            let n = stream.read_buf(&mut buffer).await.unwrap();
            assert!(n > 0, "peer closed before sending a full request head");
        }

        stream.write_all(response).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
    });

    addr
}
