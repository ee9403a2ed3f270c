use serde::{Deserialize, Serialize};

pub mod msg;

/// Path prefix under which agents post their reports.
pub const AGENTS_ENDPOINT: &str = "/api/v1/agents";
/// Collector path that always answers with a plain 200, probed by every agent.
pub const PROBE_ENDPOINT: &str = "/api/v1/ping";

/// Path a given pod reports to.
pub fn agent_report_path(pod_name: &str) -> String {
    format!("{AGENTS_ENDPOINT}/{pod_name}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    #[serde(rename = "podname")]
    pub pod_name: String,
    #[serde(rename = "nodename")]
    pub node_name: String,
}

/// Outcome of one HTTP probe, timings in whole milliseconds.
///
/// Key names are the ones the collector has always accepted and must stay stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ProbeResult {
    #[serde(rename = "URL")]
    pub url: String,
    #[serde(rename = "ConnectionResult", with = "connection_result")]
    pub connection_succeeded: bool,
    #[serde(rename = "HTTPCode")]
    pub http_code: u16,
    pub total: u64,
    pub content_transfer: u64,
    #[serde(rename = "TCPConnection")]
    pub tcp_connection: u64,
    #[serde(rename = "DNSLookup")]
    pub dns_lookup: u64,
    pub connect: u64,
    pub server_processing: u64,
}

impl ProbeResult {
    /// Placeholder held by a slot before its first probe lands.
    pub fn pending(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// A probe that never got a response: only the total time is known.
    pub fn failed(url: impl Into<String>, total: u64) -> Self {
        Self {
            url: url.into(),
            total,
            ..Default::default()
        }
    }
}

// the collector expects 1/0 rather than a JSON boolean
mod connection_result {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(u8::deserialize(deserializer)? != 0)
    }
}
