use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use log::warn;
use netchecker_proto::{NodeIdentity, PROBE_ENDPOINT};
use serde::{Deserialize, Serialize};

/// Pod name injected through the downward API. Mandatory.
pub const ENV_POD_NAME: &str = "MY_POD_NAME";
/// Node name injected through the downward API. Optional.
pub const ENV_NODE_NAME: &str = "MY_NODE_NAME";
/// Prefix of environment variables overriding config keys.
pub const ENV_PREFIX: &str = "NETCHECKER_";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("environment variable MY_POD_NAME is not set, no point in sending info")]
    MissingPodName,
    #[error("report interval must be at least one second")]
    InvalidReportInterval,
    #[error("invalid configuration: {0}")]
    Extract(#[from] Box<figment::Error>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Collector address as `host:port`
    pub server_endpoint: String,
    /// Seconds between two reports
    pub report_interval: u64,
    /// Extra HTTP targets, the collector ping path is always appended
    pub probe_urls: Vec<String>,
    /// Pad each report with as many zero bytes as the path MTU
    pub mtu_padding: bool,
    /// Fixed padding length used when `mtu_padding` is off, 0 disables it
    pub zero_extender_length: usize,
    /// Report DNS/connect/server/transfer breakdown, not only the total
    pub phase_timing: bool,
    pub prefer_ipv6: bool,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_endpoint: "netchecker-service:8081".to_owned(),
            report_interval: 60,
            probe_urls: Vec::new(),
            mtu_padding: false,
            zero_extender_length: 0,
            phase_timing: true,
            prefer_ipv6: false,
        }
    }
}

impl AgentConfig {
    /// Defaults, then the TOML file, then `NETCHECKER_*` variables, then `overrides`.
    pub fn load<T: Serialize>(path: &str, overrides: T) -> Result<Self, ConfigError> {
        Self::figment(path, overrides)
            .extract::<Self>()
            .map_err(Box::new)?
            .validated()
    }

    fn figment<T: Serialize>(path: &str, overrides: T) -> Figment {
        Figment::from(Serialized::defaults(AgentConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(overrides))
    }

    fn validated(self) -> Result<Self, ConfigError> {
        if self.report_interval == 0 {
            return Err(ConfigError::InvalidReportInterval);
        }
        Ok(self)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval)
    }

    /// Per-request deadline, kept below the interval so two reports never overlap.
    pub fn request_timeout(&self) -> Duration {
        match self.report_interval {
            0 | 1 => self.report_interval() / 2,
            secs => Duration::from_secs(secs - 1),
        }
    }

    /// Configured targets followed by the collector's own ping endpoint.
    pub fn probe_targets(&self) -> Vec<String> {
        self.probe_urls
            .iter()
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
            .map(|url| {
                if url.contains("://") {
                    url.to_owned()
                } else {
                    format!("http://{url}")
                }
            })
            .chain(std::iter::once(format!(
                "http://{}{PROBE_ENDPOINT}",
                self.server_endpoint
            )))
            .collect()
    }
}

/// Split a `--probe-urls` argument on `,` and `;`.
pub fn split_probe_urls(arg: &str) -> Vec<String> {
    arg.split([',', ';'])
        .map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Read the pod/node identity through `lookup`, usually `std::env::var`.
pub fn node_identity<F>(lookup: F) -> Result<NodeIdentity, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let pod_name = lookup(ENV_POD_NAME)
        .filter(|name| !name.is_empty())
        .ok_or(ConfigError::MissingPodName)?;

    let node_name = lookup(ENV_NODE_NAME)
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| {
            warn!("environment variable {ENV_NODE_NAME} is not set");
            String::new()
        });

    Ok(NodeIdentity {
        pod_name,
        node_name,
    })
}
