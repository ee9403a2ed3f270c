use std::{net::SocketAddr, pin::Pin, time::Duration};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use http::{Method, Request, Response, Uri, header, request, response};
use itertools::Itertools;
use log::{debug, trace};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, lookup_host},
    task::JoinSet,
};
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream, native_tls::TlsConnector};

const HAPPY_EYEBALLS_DELAY: Duration = Duration::from_millis(150);
const USER_AGENT: &str = concat!("netchecker-agent/", env!("CARGO_PKG_VERSION"));

pub enum MaybeTlsStream<S> {
    Plain(S),
    Tls(TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for MaybeTlsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for MaybeTlsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_flush(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MaybeTlsStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            MaybeTlsStream::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

/// Where a request has to go: host without IPv6 brackets, port, and whether TLS is needed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination<'a> {
    pub host: &'a str,
    pub port: u16,
    pub tls: bool,
}

pub fn destination(uri: &Uri) -> anyhow::Result<Destination<'_>> {
    let tls = match uri.scheme_str() {
        Some("https") => true,
        Some("http") | None => false,
        Some(other) => anyhow::bail!("URL error: unsupported scheme {other}"),
    };
    let host = uri
        .host()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);
    if host.is_empty() {
        anyhow::bail!("URL error: empty host name");
    }
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });

    Ok(Destination { host, port, tls })
}

pub fn basic_request_builder(uri: &str, method: Method) -> anyhow::Result<request::Builder> {
    let uri = uri.parse::<Uri>()?;
    let authority = uri
        .authority()
        .ok_or_else(|| anyhow::anyhow!("URL error: no host name"))?
        .as_str();
    let host = authority
        .find('@')
        .map(|idx| authority.split_at(idx + 1).1)
        .unwrap_or(authority);

    if host.is_empty() {
        anyhow::bail!("URL error: empty host name");
    }

    let req = Request::builder()
        .method(method)
        .header(header::HOST, host)
        .header(header::USER_AGENT, USER_AGENT)
        .header(header::CONNECTION, "close")
        .header(header::ACCEPT_ENCODING, "identity")
        .uri(&uri);

    Ok(req)
}

pub async fn send_http_request<T: AsRef<[u8]>>(
    req: Request<T>,
    prefer_ipv6: bool,
) -> anyhow::Result<Response<Bytes>> {
    let dest = destination(req.uri())?;
    let addrs = resolve(dest.host, dest.port, prefer_ipv6).await?;
    let stream = connect_happy_eyeballs(addrs).await?;
    let stream = &mut handshake(stream, dest.host, dest.tls).await?;

    stream.write_all(&assemble_http_request(&req)).await?;
    stream.flush().await?;

    let resp = {
        let mut buffer = BytesMut::with_capacity(128);
        while stream.read_buf(&mut buffer).await? != 0 {}

        let buffer = buffer.freeze();
        trace!("Response: {:?}", String::from_utf8_lossy(&buffer));
        parse_http_response(buffer)?
    };

    Ok(resp)
}

/// Look up `host` and order the addresses for happy eyeballs, preferred family first.
pub async fn resolve(host: &str, port: u16, prefer_ipv6: bool) -> anyhow::Result<Vec<SocketAddr>> {
    trace!("looking up ({host}, {port})");
    let (v4, v6): (Vec<_>, Vec<_>) = lookup_host((host, port)).await?.partition(|a| a.is_ipv4());

    let (first, second) = if prefer_ipv6 { (v6, v4) } else { (v4, v6) };
    Ok(first.into_iter().interleave(second).collect())
}

pub async fn handshake(
    stream: TcpStream,
    domain: &str,
    tls: bool,
) -> anyhow::Result<MaybeTlsStream<TcpStream>> {
    let stream = if tls {
        let connector = TokioTlsConnector::from(TlsConnector::new()?);
        let tls_stream = connector.connect(domain, stream).await?;
        MaybeTlsStream::Tls(tls_stream)
    } else {
        MaybeTlsStream::Plain(stream)
    };

    Ok(stream)
}

pub async fn connect_happy_eyeballs(addrs: Vec<SocketAddr>) -> anyhow::Result<TcpStream> {
    let mut attempts = JoinSet::new();
    let handle_attempt_result = move |res: Result<Result<TcpStream, _>, _>| match res {
        Ok(Ok(stream)) => {
            debug!(
                "connection established with {}",
                stream
                    .peer_addr()
                    .map(|a| a.to_string())
                    .unwrap_or("<unknown>".to_string())
            );
            Some(stream)
        }
        Ok(Err(e)) => {
            trace!("connection attempt failed: {e}");
            None
        }
        Err(e) => {
            trace!("connection attempt panicked: {e}");
            None
        }
    };
    for addr in addrs {
        attempts.spawn(TcpStream::connect(addr));
        while !attempts.is_empty() {
            tokio::select! {
                biased;

                Some(res) = attempts.join_next() => {
                    if let Some(stream) = handle_attempt_result(res) {
                        return Ok(stream);
                    }
                }
                _ = tokio::time::sleep(HAPPY_EYEBALLS_DELAY) => {
                    break;
                }
            }
        }
    }

    while let Some(res) = attempts.join_next().await {
        if let Some(stream) = handle_attempt_result(res) {
            return Ok(stream);
        }
    }

    Err(anyhow::anyhow!("I/O error: all connection attempts failed"))
}

pub fn assemble_http_request<T: AsRef<[u8]>>(req: &Request<T>) -> Bytes {
    let mut buffer = BytesMut::with_capacity(128);

    buffer.put_slice(
        format!(
            "{} {} {:?}\r\n",
            req.method(),
            req.uri()
                .path_and_query()
                .map(|pq| pq.as_str())
                .unwrap_or("/"),
            req.version()
        )
        .as_bytes(),
    );

    for (name, value) in req.headers() {
        buffer.put_slice(name.as_str().as_bytes());
        buffer.put_slice(b": ");
        buffer.put(value.as_bytes());
        buffer.put_slice(b"\r\n");
    }

    buffer.put_slice(b"\r\n");

    buffer.put_slice(req.body().as_ref());

    trace!(
        "Request head: {:?}",
        String::from_utf8_lossy(&buffer[..buffer.len() - req.body().as_ref().len()])
    );

    buffer.freeze()
}

pub fn parse_http_response(bytes: Bytes) -> anyhow::Result<http::Response<Bytes>> {
    const MAX_HEADERS: usize = 64;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let status = resp.parse(&bytes)?;

    if status.is_partial() {
        anyhow::bail!("HTTP error: response is incomplete");
    }

    let body_start_index = status.unwrap();

    let mut response_builder = response::Builder::new()
        .status(resp.code.unwrap_or(200))
        .version(match resp.version.unwrap_or(1) {
            0 => http::Version::HTTP_10,
            1 => http::Version::HTTP_11,
            2 => http::Version::HTTP_2,
            _ => http::Version::HTTP_11,
        });

    for header in resp.headers {
        response_builder = response_builder.header(header.name, header.value);
    }

    let body = bytes.slice(body_start_index..);

    Ok(response_builder.body(body)?)
}

/// How the end of a response body is recognised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Length(u64),
    Chunked,
    UntilEof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// Offset of the first body byte in the parsed buffer
    pub body_start: usize,
    pub framing: BodyFraming,
}

/// Parse a response head, `None` while it is still incomplete.
pub fn parse_response_head(bytes: &[u8]) -> anyhow::Result<Option<ResponseHead>> {
    const MAX_HEADERS: usize = 64;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);

    let body_start = match resp.parse(bytes)? {
        httparse::Status::Complete(body_start) => body_start,
        httparse::Status::Partial => return Ok(None),
    };
    let status = resp
        .code
        .ok_or_else(|| anyhow::anyhow!("HTTP error: no status code"))?;

    let find_header = |name: &http::HeaderName| {
        resp.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name.as_str()))
            .map(|h| String::from_utf8_lossy(h.value).trim().to_ascii_lowercase())
    };

    // 1xx, 204 and 304 never carry a body
    let framing = if status < 200 || status == 204 || status == 304 {
        BodyFraming::Length(0)
    } else if find_header(&header::TRANSFER_ENCODING).is_some_and(|te| te.ends_with("chunked")) {
        BodyFraming::Chunked
    } else if let Some(len) = find_header(&header::CONTENT_LENGTH) {
        BodyFraming::Length(
            len.parse()
                .map_err(|_| anyhow::anyhow!("HTTP error: invalid content length {len:?}"))?,
        )
    } else {
        BodyFraming::UntilEof
    };

    Ok(Some(ResponseHead {
        status,
        body_start,
        framing,
    }))
}

/// Read and discard the rest of a body. `buf` holds the body bytes already received.
/// Returns as soon as the body is complete, even if the peer keeps the connection open.
pub async fn drain_body<S: AsyncRead + Unpin>(
    stream: &mut S,
    framing: BodyFraming,
    mut buf: BytesMut,
) -> anyhow::Result<()> {
    match framing {
        BodyFraming::Length(len) => {
            let mut remaining = len.saturating_sub(buf.len() as u64);
            let mut sink = [0u8; 8192];
            while remaining > 0 {
                let want = remaining.min(sink.len() as u64) as usize;
                let n = stream.read(&mut sink[..want]).await?;
                if n == 0 {
                    anyhow::bail!("HTTP error: body is incomplete, {remaining} bytes missing");
                }
                remaining = remaining.saturating_sub(n as u64);
            }
        }
        BodyFraming::Chunked => {
            let mut skip = 0usize;
            loop {
                let n = skip.min(buf.len());
                buf.advance(n);
                skip -= n;

                if skip == 0 {
                    match httparse::parse_chunk_size(&buf) {
                        Ok(httparse::Status::Complete((idx, 0))) => {
                            let rest = &buf[idx..];
                            if rest.starts_with(b"\r\n")
                                || rest.windows(4).any(|w| w == b"\r\n\r\n")
                            {
                                return Ok(());
                            }
                        }
                        Ok(httparse::Status::Complete((idx, size))) => {
                            buf.advance(idx);
                            // chunk data plus its CRLF
                            skip = usize::try_from(size)?.saturating_add(2);
                            continue;
                        }
                        Ok(httparse::Status::Partial) => {}
                        Err(_) => anyhow::bail!("HTTP error: invalid chunk size"),
                    }
                }

                if stream.read_buf(&mut buf).await? == 0 {
                    anyhow::bail!("HTTP error: chunked body is incomplete");
                }
            }
        }
        BodyFraming::UntilEof => {
            let mut sink = [0u8; 8192];
            loop {
                match stream.read(&mut sink).await {
                    Ok(0) => break,
                    Ok(_) => {}
                    // TLS peers often close without close_notify
                    Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }

    Ok(())
}
