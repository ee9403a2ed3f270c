use bytes::{BufMut, Bytes, BytesMut};
use netchecker_proto::{NodeIdentity, ProbeResult, msg::Report};
use time::OffsetDateTime;

use crate::netinfo::NetworkSnapshot;

/// How many zero bytes trail the JSON body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Padding {
    Off,
    Fixed(usize),
    /// As many bytes as the path MTU, so the request cannot fit in one packet.
    PathMtu,
}

impl Padding {
    pub fn new(mtu_padding: bool, zero_extender_length: usize) -> Self {
        match (mtu_padding, zero_extender_length) {
            (true, _) => Padding::PathMtu,
            (false, 0) => Padding::Off,
            (false, len) => Padding::Fixed(len),
        }
    }

    fn len(self, path_mtu: u32) -> usize {
        match self {
            Padding::Off => 0,
            Padding::Fixed(len) => len,
            Padding::PathMtu => path_mtu as usize,
        }
    }
}

/// A report ready to go on the wire.
#[derive(Debug, Clone)]
pub struct Payload {
    pub report: Report,
    pub padding: usize,
}

impl Payload {
    /// JSON body followed by the zero padding.
    pub fn to_bytes(&self) -> serde_json::Result<Bytes> {
        let mut writer = BytesMut::with_capacity(1024 + self.padding).writer();
        serde_json::to_writer(&mut writer, &self.report)?;

        let mut buffer = writer.into_inner();
        buffer.put_bytes(0, self.padding);
        Ok(buffer.freeze())
    }
}

#[derive(Debug, Clone)]
pub struct PayloadBuilder {
    identity: NodeIdentity,
    report_interval: u64,
    padding: Padding,
}

impl PayloadBuilder {
    pub fn new(identity: NodeIdentity, report_interval: u64, padding: Padding) -> Self {
        Self {
            identity,
            report_interval,
            padding,
        }
    }

    pub fn build(&self, snapshot: NetworkSnapshot, probes: Vec<ProbeResult>) -> Payload {
        let padding = self.padding.len(snapshot.path_mtu);
        Payload {
            report: Report {
                report_interval: self.report_interval,
                identity: self.identity.clone(),
                host_date: OffsetDateTime::now_utc(),
                lookup_host: snapshot.lookup_host,
                ips: snapshot.interface_addresses,
                network_probes: probes,
            },
            padding,
        }
    }
}
