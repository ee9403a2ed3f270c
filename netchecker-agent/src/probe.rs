//! HTTP latency probing with a per-phase breakdown.
//!
//! Every target owns one slot. Probe tasks are spawned and never joined; each publishes
//! a complete [`ProbeResult`] into its slot when it finishes, and the report cycle reads
//! whatever is resident at that moment. A result may therefore lag one report behind,
//! which collectors already tolerate.

use std::{sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use http::Method;
use log::{debug, warn};
use netchecker_proto::ProbeResult;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    sync::watch,
    time::{Instant, timeout},
};

use crate::http_util;

/// Phases in the order they are logged.
const PHASE_FIELDS: [(&str, fn(&ProbeResult) -> u64); 6] = [
    ("Total", |r| r.total),
    ("ContentTransfer", |r| r.content_transfer),
    ("Connect", |r| r.connect),
    ("DNSLookup", |r| r.dns_lookup),
    ("ServerProcessing", |r| r.server_processing),
    ("TCPConnection", |r| r.tcp_connection),
];

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Connection(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy)]
pub struct ProbeSettings {
    pub timeout: Duration,
    pub prefer_ipv6: bool,
    pub phase_timing: bool,
}

/// One latest-value slot per target, addressed by the target's index.
#[derive(Debug)]
pub struct ProbeSlots {
    slots: Vec<watch::Sender<ProbeResult>>,
}

impl ProbeSlots {
    pub fn new(targets: &[String]) -> Self {
        let slots = targets
            .iter()
            .map(|url| watch::Sender::new(ProbeResult::pending(url.as_str())))
            .collect();
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn publish(&self, idx: usize, result: ProbeResult) {
        if let Some(slot) = self.slots.get(idx) {
            slot.send_replace(result);
        }
    }

    /// Latest result of every target, in target order.
    pub fn snapshot(&self) -> Vec<ProbeResult> {
        self.slots.iter().map(|slot| slot.borrow().clone()).collect()
    }

    #[cfg(test)]
    pub fn subscribe(&self, idx: usize) -> watch::Receiver<ProbeResult> {
        self.slots[idx].subscribe()
    }
}

#[derive(Debug)]
pub struct Prober {
    targets: Arc<[String]>,
    slots: Arc<ProbeSlots>,
    settings: ProbeSettings,
}

impl Prober {
    pub fn new(targets: Vec<String>, settings: ProbeSettings) -> Self {
        let slots = Arc::new(ProbeSlots::new(&targets));
        Self {
            targets: targets.into(),
            slots,
            settings,
        }
    }

    pub fn slots(&self) -> &ProbeSlots {
        &self.slots
    }

    /// Start one probe per target without waiting for any of them.
    pub fn fire(&self) {
        for (idx, url) in self.targets.iter().enumerate() {
            let slots = self.slots.clone();
            let url = url.clone();
            let settings = self.settings;
            tokio::spawn(async move {
                let result = probe(&url, settings).await;
                slots.publish(idx, result);
            });
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Phases {
    dns: Duration,
    tcp: Duration,
    tls: Duration,
    server_processing: Duration,
    content_transfer: Duration,
}

/// Issue one GET to `url` and measure it. Never fails: errors become a failed result.
pub async fn probe(url: &str, settings: ProbeSettings) -> ProbeResult {
    let start = Instant::now();
    let outcome = match timeout(settings.timeout, timed_get(url, settings.prefer_ipv6)).await {
        Ok(res) => res.map_err(ProbeError::from),
        Err(_) => Err(ProbeError::Timeout(settings.timeout)),
    };
    let total = millis(start.elapsed());

    let result = match outcome {
        Ok((http_code, phases)) => {
            let mut result = ProbeResult {
                url: url.to_owned(),
                connection_succeeded: true,
                http_code,
                total,
                ..Default::default()
            };
            if settings.phase_timing {
                result.dns_lookup = millis(phases.dns);
                result.tcp_connection = millis(phases.tcp);
                result.connect = millis(phases.dns + phases.tcp + phases.tls);
                result.server_processing = millis(phases.server_processing);
                result.content_transfer = millis(phases.content_transfer);
            }
            result
        }
        Err(e @ ProbeError::Timeout(_)) => {
            warn!("HTTP probe ({url}) {e}");
            ProbeResult::failed(url, total)
        }
        Err(e) => {
            warn!("HTTP probe ({url}) failed: {e:#}");
            ProbeResult::failed(url, total)
        }
    };

    debug!(
        "HTTP probe ({url}): HTTPCode: {}; {}",
        result.http_code,
        describe_phases(&result)
    );
    result
}

fn describe_phases(result: &ProbeResult) -> String {
    PHASE_FIELDS
        .iter()
        .map(|(name, field)| format!("{name}: {} ms; ", field(result)))
        .collect()
}

async fn timed_get(url: &str, prefer_ipv6: bool) -> anyhow::Result<(u16, Phases)> {
    let req = http_util::basic_request_builder(url, Method::GET)?.body(Bytes::new())?;
    let dest = http_util::destination(req.uri())?;
    let mut phases = Phases::default();

    let mark = Instant::now();
    let addrs = http_util::resolve(dest.host, dest.port, prefer_ipv6).await?;
    phases.dns = mark.elapsed();

    let mark = Instant::now();
    let stream = http_util::connect_happy_eyeballs(addrs).await?;
    phases.tcp = mark.elapsed();

    let mark = Instant::now();
    let mut stream = http_util::handshake(stream, dest.host, dest.tls).await?;
    phases.tls = mark.elapsed();

    stream
        .write_all(&http_util::assemble_http_request(&req))
        .await?;
    stream.flush().await?;

    let mark = Instant::now();
    let mut buffer = BytesMut::with_capacity(1024);
    if stream.read_buf(&mut buffer).await? == 0 {
        anyhow::bail!("HTTP error: connection closed before response");
    }
    phases.server_processing = mark.elapsed();

    let mark = Instant::now();
    let head = loop {
        if let Some(head) = http_util::parse_response_head(&buffer)? {
            break head;
        }
        if stream.read_buf(&mut buffer).await? == 0 {
            anyhow::bail!("HTTP error: response is incomplete");
        }
    };
    // drain the body so the transfer time covers all of it
    let body = buffer.split_off(head.body_start);
    http_util::drain_body(&mut stream, head.framing, body).await?;
    phases.content_transfer = mark.elapsed();

    Ok((head.status, phases))
}

fn millis(d: Duration) -> u64 {
    d.as_millis() as u64
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use tokio::net::TcpListener;

    use super::*;
    use crate::test_util::{serve_and_hold, serve_once};

    const OK_RESPONSE: &[u8] =
        b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello";

    fn settings(timeout: Duration) -> ProbeSettings {
        ProbeSettings {
            timeout,
            prefer_ipv6: false,
            phase_timing: true,
        }
    }

    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
    }

    fn assert_failed_shape(res: &ProbeResult) {
        assert!(!res.connection_succeeded);
        assert_eq!(res.http_code, 0);
        assert_eq!(res.content_transfer, 0);
        assert_eq!(res.tcp_connection, 0);
        assert_eq!(res.dns_lookup, 0);
        assert_eq!(res.connect, 0);
        assert_eq!(res.server_processing, 0);
    }

    #[tokio::test]
    async fn test_probe_success() {
        let (addr, _) = serve_once(OK_RESPONSE).await;
        let url = format!("http://{addr}/api/v1/ping");

        let res = probe(&url, settings(Duration::from_secs(5))).await;

        assert_eq!(res.url, url);
        assert!(res.connection_succeeded);
        assert_eq!(res.http_code, 200);
        assert!(res.total >= res.connect);
        assert!(res.connect >= res.dns_lookup + res.tcp_connection);
    }

    #[tokio::test]
    async fn test_connect_includes_dns() {
        let (addr, _) = serve_once(OK_RESPONSE).await;
        let url = format!("http://localhost:{}/", addr.port());

        let res = probe(&url, settings(Duration::from_secs(5))).await;

        assert!(res.connection_succeeded);
        assert!(res.connect >= res.dns_lookup + res.tcp_connection);
    }

    #[tokio::test]
    async fn test_probe_length_framed_on_open_connection() {
        let addr = serve_and_hold(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello").await;

        let res = probe(&format!("http://{addr}/"), settings(Duration::from_secs(2))).await;

        assert!(res.connection_succeeded);
        assert_eq!(res.http_code, 200);
        assert!(res.total < 2000);
    }

    #[tokio::test]
    async fn test_probe_chunked_on_open_connection() {
        let addr = serve_and_hold(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await;

        let res = probe(&format!("http://{addr}/"), settings(Duration::from_secs(2))).await;

        assert!(res.connection_succeeded);
        assert_eq!(res.http_code, 200);
        assert!(res.total < 2000);
    }

    #[tokio::test]
    async fn test_probe_keeps_status_code() {
        let (addr, _) =
            serve_once(b"HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\n\r\n").await;

        let res = probe(&format!("http://{addr}/"), settings(Duration::from_secs(5))).await;

        assert!(res.connection_succeeded);
        assert_eq!(res.http_code, 503);
    }

    #[tokio::test]
    async fn test_probe_refused() {
        let addr = refused_addr().await;

        let res = probe(&format!("http://{addr}/"), settings(Duration::from_secs(5))).await;

        assert_failed_shape(&res);
    }

    #[tokio::test]
    async fn test_probe_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept, then never answer
        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let res = probe(&format!("http://{addr}/"), settings(Duration::from_millis(200))).await;

        assert_failed_shape(&res);
        assert!(res.total >= 200);
    }

    #[tokio::test]
    async fn test_probe_invalid_url() {
        let res = probe("http://", settings(Duration::from_secs(1))).await;

        assert_eq!(res.url, "http://");
        assert_failed_shape(&res);
    }

    #[tokio::test]
    async fn test_probe_without_phase_timing() {
        let (addr, _) = serve_once(OK_RESPONSE).await;
        let settings = ProbeSettings {
            phase_timing: false,
            ..settings(Duration::from_secs(5))
        };

        let res = probe(&format!("http://{addr}/"), settings).await;

        assert!(res.connection_succeeded);
        assert_eq!(res.http_code, 200);
        assert_eq!(
            (res.dns_lookup, res.connect, res.tcp_connection),
            (0, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_fire_fills_every_slot() {
        let (ok_addr, _) = serve_once(OK_RESPONSE).await;
        let targets = vec![
            format!("http://{}/", refused_addr().await),
            format!("http://{ok_addr}/api/v1/ping"),
        ];
        let prober = Prober::new(targets.clone(), settings(Duration::from_secs(5)));
        let mut watchers: Vec<_> = (0..targets.len())
            .map(|idx| prober.slots().subscribe(idx))
            .collect();

        let before = prober.slots().snapshot();
        assert_eq!(before.len(), 2);
        assert!(before.iter().zip(&targets).all(|(r, url)| &r.url == url));

        prober.fire();
        for watcher in &mut watchers {
            timeout(Duration::from_secs(5), watcher.changed())
                .await
                .unwrap()
                .unwrap();
        }

        let after = prober.slots().snapshot();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0].url, targets[0]);
        assert!(!after[0].connection_succeeded);
        assert_eq!(after[1].url, targets[1]);
        assert_eq!(after[1].http_code, 200);
    }

    #[test]
    fn test_describe_phases_order() {
        let res = ProbeResult {
            total: 6,
            content_transfer: 5,
            connect: 4,
            dns_lookup: 3,
            server_processing: 2,
            tcp_connection: 1,
            ..Default::default()
        };
        assert_eq!(
            describe_phases(&res),
            "Total: 6 ms; ContentTransfer: 5 ms; Connect: 4 ms; DNSLookup: 3 ms; \
             ServerProcessing: 2 ms; TCPConnection: 1 ms; "
        );
    }

    #[test]
    fn test_publish_out_of_range_is_ignored() {
        let slots = ProbeSlots::new(&["http://a/".to_owned()]);
        slots.publish(3, ProbeResult::pending("http://b/"));
        assert_eq!(slots.len(), 1);
        assert_eq!(slots.snapshot()[0].url, "http://a/");
    }
}
