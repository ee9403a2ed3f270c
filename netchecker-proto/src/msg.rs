use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::{NodeIdentity, ProbeResult};

/// Body of `POST /api/v1/agents/{podname}`.
///
/// Maps are ordered so two reports built from the same facts serialize identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub report_interval: u64,
    #[serde(flatten)]
    pub identity: NodeIdentity,
    #[serde(rename = "hostdate", with = "time::serde::rfc3339")]
    pub host_date: OffsetDateTime,
    #[serde(rename = "nslookup")]
    pub lookup_host: BTreeMap<String, Vec<String>>,
    pub ips: BTreeMap<String, Vec<String>>,
    pub network_probes: Vec<ProbeResult>,
}

impl Report {
    /// Decode a report as received on the wire, ignoring any trailing zero padding.
    pub fn from_wire(bytes: &[u8]) -> serde_json::Result<Self> {
        let end = bytes.iter().rposition(|b| *b != 0).map_or(0, |idx| idx + 1);
        serde_json::from_slice(&bytes[..end])
    }
}
