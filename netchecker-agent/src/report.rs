use std::time::Duration;

use http::{Method, StatusCode, header};
use log::{debug, trace, warn};
use netchecker_proto::agent_report_path;

use crate::{http_util, payload::Payload};

/// Posts reports to the collector. Any HTTP answer counts as delivered.
#[derive(Debug, Clone)]
pub struct Reporter {
    server_endpoint: String,
    timeout: Duration,
    prefer_ipv6: bool,
}

impl Reporter {
    pub fn new(server_endpoint: &str, timeout: Duration, prefer_ipv6: bool) -> Self {
        Self {
            server_endpoint: server_endpoint.to_owned(),
            timeout,
            prefer_ipv6,
        }
    }

    pub fn report_url(&self, pod_name: &str) -> String {
        format!(
            "http://{}{}",
            self.server_endpoint,
            agent_report_path(pod_name)
        )
    }

    pub async fn send(&self, payload: &Payload) -> anyhow::Result<StatusCode> {
        let uri = self.report_url(&payload.report.identity.pod_name);
        trace!("Request payload before marshaling: {:?}", payload.report);
        let body = payload.to_bytes()?;

        debug!("Send payload via URL: {uri}");
        let req = http_util::basic_request_builder(&uri, Method::POST)?
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_LENGTH, body.len())
            .body(body)?;

        let resp = tokio::time::timeout(
            self.timeout,
            http_util::send_http_request(req, self.prefer_ipv6),
        )
        .await
        .map_err(|_| anyhow::anyhow!("report timed out after {:?}", self.timeout))??;

        Ok(resp.status())
    }
}

/// A rejected report is only worth a warning, the next cycle tries again anyway.
pub fn analyze_response(status: StatusCode) -> bool {
    if !status.is_success() {
        warn!("Response from the server is not OK: {status}");
        return false;
    }
    true
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use netchecker_proto::{NodeIdentity, ProbeResult, msg::Report};
    use time::OffsetDateTime;

    use super::*;
    use crate::test_util::serve_once;

    fn payload(padding: usize) -> Payload {
        Payload {
            report: Report {
                report_interval: 5,
                identity: NodeIdentity {
                    pod_name: "test-pod".to_owned(),
                    node_name: "localhost".to_owned(),
                },
                host_date: OffsetDateTime::now_utc(),
                lookup_host: BTreeMap::new(),
                ips: BTreeMap::new(),
                network_probes: vec![ProbeResult::failed("0.0.0.0:8081", 50)],
            },
            padding,
        }
    }

    #[test]
    fn test_report_url() {
        let reporter = Reporter::new("localhost:8888", Duration::from_secs(4), false);
        assert_eq!(
            reporter.report_url("test-pod"),
            "http://localhost:8888/api/v1/agents/test-pod"
        );
    }

    #[tokio::test]
    async fn test_send() {
        let (addr, captured) = serve_once(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").await;
        let reporter = Reporter::new(&addr.to_string(), Duration::from_secs(4), false);
        let payload = payload(100);

        let status = reporter.send(&payload).await.unwrap();
        assert_eq!(status, StatusCode::OK);

        let req = captured.await.unwrap();
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/v1/agents/test-pod");
        assert_eq!(req.header("content-type"), Some("application/json"));
        assert!(req.body.ends_with(&[0; 100]));
        assert_eq!(Report::from_wire(&req.body).unwrap(), payload.report);
    }

    #[tokio::test]
    async fn test_send_rejected_is_not_an_error() {
        let (addr, _) =
            serve_once(b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\n\r\n").await;
        let reporter = Reporter::new(&addr.to_string(), Duration::from_secs(4), false);

        let status = reporter.send(&payload(0)).await.unwrap();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!analyze_response(status));
    }

    #[tokio::test]
    async fn test_send_unreachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let reporter = Reporter::new(&addr.to_string(), Duration::from_secs(4), false);

        assert!(reporter.send(&payload(0)).await.is_err());
    }

    #[test]
    fn test_analyze_response() {
        assert!(analyze_response(StatusCode::OK));
        assert!(analyze_response(StatusCode::ACCEPTED));
        assert!(!analyze_response(StatusCode::INTERNAL_SERVER_ERROR));
    }
}
