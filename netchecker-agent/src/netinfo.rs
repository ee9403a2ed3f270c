use std::{
    collections::BTreeMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    time::Duration,
};

use itertools::Itertools;
use log::{debug, error, trace, warn};
use tokio::{
    net::{UdpSocket, lookup_host},
    time::timeout,
};

/// Port used only to pick a route; connecting a UDP socket sends nothing.
const ROUTE_PROBE_PORT: u16 = 9;

/// Local network facts gathered right before a report is built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkSnapshot {
    pub interface_addresses: BTreeMap<String, Vec<String>>,
    pub lookup_host: BTreeMap<String, Vec<String>>,
    /// MTU of the link carrying traffic to the collector, 0 when unknown
    pub path_mtu: u32,
}

/// Reads interface, DNS and route state. Holds no state between queries, interfaces
/// may come and go between two reports.
#[derive(Debug, Clone)]
pub struct NetworkQuerent {
    server_endpoint: String,
    path_mtu: bool,
    lookup_timeout: Duration,
}

impl NetworkQuerent {
    pub fn new(server_endpoint: &str, path_mtu: bool, lookup_timeout: Duration) -> Self {
        Self {
            server_endpoint: server_endpoint.to_owned(),
            path_mtu,
            lookup_timeout,
        }
    }

    pub async fn query_snapshot(&self) -> NetworkSnapshot {
        let interfaces = netdev::get_interfaces();
        let lookup_host = Self::query_nslookup(&self.server_endpoint, self.lookup_timeout).await;

        let path_mtu = if self.path_mtu {
            let destinations: Vec<IpAddr> = lookup_host
                .values()
                .flatten()
                .filter_map(|ip| ip.parse().ok())
                .collect();
            Self::query_path_mtu(&interfaces, &destinations).await
        } else {
            0
        };

        NetworkSnapshot {
            interface_addresses: Self::interface_addresses(&interfaces),
            lookup_host,
            path_mtu,
        }
    }

    /// Addresses bound to every local interface, in CIDR notation.
    pub fn query_interfaces() -> BTreeMap<String, Vec<String>> {
        Self::interface_addresses(&netdev::get_interfaces())
    }

    fn interface_addresses(interfaces: &[netdev::Interface]) -> BTreeMap<String, Vec<String>> {
        let result: BTreeMap<_, _> = interfaces
            .iter()
            .map(|iface| {
                let addrs = iface
                    .ipv4
                    .iter()
                    .map(|net| net.to_string())
                    .chain(iface.ipv6.iter().map(|net| net.to_string()))
                    .collect();
                (iface.name.clone(), addrs)
            })
            .collect();
        trace!("Addresses of host's links: {result:?}");

        result
    }

    /// Resolve the host part of `endpoint`. A failed or late lookup maps the host to
    /// no address.
    pub async fn query_nslookup(
        endpoint: &str,
        lookup_timeout: Duration,
    ) -> BTreeMap<String, Vec<String>> {
        let host = endpoint_host(endpoint);

        let addrs = lookup_addrs(&host, lookup_host((host.as_str(), 0)), lookup_timeout).await;

        BTreeMap::from([(host, addrs)])
    }

    /// MTU of the interface owning the source address of the first routable destination.
    pub async fn query_path_mtu(interfaces: &[netdev::Interface], destinations: &[IpAddr]) -> u32 {
        for &dest in destinations {
            let local = match route_source(dest).await {
                Ok(Some(local)) => local,
                Ok(None) => {
                    debug!("no usable route towards {dest}");
                    continue;
                }
                Err(e) => {
                    warn!("route lookup towards {dest} failed: {e}");
                    continue;
                }
            };

            let mtu = interfaces
                .iter()
                .find(|iface| {
                    iface.ipv4.iter().any(|net| IpAddr::V4(net.addr()) == local)
                        || iface.ipv6.iter().any(|net| IpAddr::V6(net.addr()) == local)
                })
                .and_then(|iface| {
                    debug!("route towards {dest} leaves through {} ({local})", iface.name);
                    iface.mtu
                });
            match mtu {
                Some(mtu) => return mtu,
                None => debug!("no interface with MTU owns {local}"),
            }
        }

        warn!("unable to determine path MTU towards {destinations:?}");
        0
    }
}

/// Await `lookup` for at most `lookup_timeout`; any failure yields no address.
async fn lookup_addrs<F, I>(host: &str, lookup: F, lookup_timeout: Duration) -> Vec<String>
where
    F: Future<Output = std::io::Result<I>>,
    I: Iterator<Item = SocketAddr>,
{
    match timeout(lookup_timeout, lookup).await {
        Ok(Ok(addrs)) => addrs.map(|addr| addr.ip().to_string()).unique().collect(),
        Ok(Err(e)) => {
            error!("DNS look up of {host} failed: {e}");
            Vec::new()
        }
        Err(_) => {
            error!("DNS look up of {host} timed out after {lookup_timeout:?}");
            Vec::new()
        }
    }
}

/// Source address the kernel picks for traffic to `dest`, if any route exists.
async fn route_source(dest: IpAddr) -> std::io::Result<Option<IpAddr>> {
    let bind: SocketAddr = match dest {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect((dest, ROUTE_PROBE_PORT)).await?;
    let local = socket.local_addr()?.ip();

    Ok((!local.is_unspecified()).then_some(local))
}

fn endpoint_host(endpoint: &str) -> String {
    let host = match endpoint.parse::<http::uri::Authority>() {
        Ok(authority) => authority.host().to_owned(),
        Err(e) => {
            error!("Error while splitting endpoint {endpoint}: {e}");
            return endpoint.to_owned();
        }
    };
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .map(str::to_owned)
        .unwrap_or(host)
}
