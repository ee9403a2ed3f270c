#![forbid(unsafe_code)]

use argh::FromArgs;
use log::LevelFilter;
use serde::Serialize;
use simple_logger::SimpleLogger;
use tokio_util::sync::CancellationToken;

use crate::{
    agent::Agent,
    config::AgentConfig,
    netinfo::NetworkQuerent,
    payload::{Padding, PayloadBuilder},
    probe::{ProbeSettings, Prober},
    report::Reporter,
};

mod agent;
mod config;
mod http_util;
mod netinfo;
mod payload;
mod probe;
mod report;
#[cfg(test)]
mod test_util;

#[derive(FromArgs, Debug)]
#[argh(description = "Node agent measuring network reachability for a netchecker collector.")]
struct AgentArgs {
    #[argh(
        option,
        short = 'c',
        default = "\"netchecker-agent.toml\".to_string()",
        description = "path to an optional TOML config file"
    )]
    config: String,
    #[argh(option, description = "collector endpoint (host:port)")]
    server_endpoint: Option<String>,
    #[argh(option, description = "agent report interval in seconds")]
    report_interval: Option<u64>,
    #[argh(
        option,
        description = "HTTP servers URLs to measure access latency to, separated by ',' or ';'"
    )]
    probe_urls: Option<String>,
    #[argh(
        switch,
        description = "pad reports with as many zero bytes as the path MTU to reveal fragmentation problems"
    )]
    mtu_padding: bool,
    #[argh(
        option,
        description = "length of the zero bytes extender appended to reports when MTU padding is off"
    )]
    zero_extender_length: Option<usize>,
    #[argh(switch, description = "report only total probe times")]
    no_phase_timing: bool,
    #[argh(switch, short = '6', description = "prefer IPv6 when resolving probe targets")]
    prefer_ipv6: bool,
}

/// Config keys set on the command line. Unset flags leave lower layers alone.
#[derive(Serialize, Debug, Default)]
struct Overrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    server_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_interval: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probe_urls: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    mtu_padding: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    zero_extender_length: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    phase_timing: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    prefer_ipv6: Option<bool>,
}

impl From<&AgentArgs> for Overrides {
    fn from(args: &AgentArgs) -> Self {
        Self {
            server_endpoint: args.server_endpoint.clone(),
            report_interval: args.report_interval,
            probe_urls: args
                .probe_urls
                .as_deref()
                .map(config::split_probe_urls),
            mtu_padding: args.mtu_padding.then_some(true),
            zero_extender_length: args.zero_extender_length,
            phase_timing: args.no_phase_timing.then_some(false),
            prefer_ipv6: args.prefer_ipv6.then_some(true),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    SimpleLogger::new()
        .with_level(LevelFilter::Info)
        .env()
        .init()?;

    let args: AgentArgs = argh::from_env();
    log::debug!("Agent args: {args:#?}");

    let cfg = AgentConfig::load(&args.config, Overrides::from(&args))?;
    log::debug!("Agent config: {cfg:#?}");

    let identity = config::node_identity(|key| std::env::var(key).ok())?;
    log::info!(
        "Starting agent for pod {} on node {:?}",
        identity.pod_name,
        identity.node_name
    );

    let timeout = cfg.request_timeout();
    let padding = Padding::new(cfg.mtu_padding, cfg.zero_extender_length);
    let agent = Agent {
        prober: Prober::new(
            cfg.probe_targets(),
            ProbeSettings {
                timeout,
                prefer_ipv6: cfg.prefer_ipv6,
                phase_timing: cfg.phase_timing,
            },
        ),
        querent: NetworkQuerent::new(&cfg.server_endpoint, padding == Padding::PathMtu, timeout),
        builder: PayloadBuilder::new(identity, cfg.report_interval, padding),
        reporter: Reporter::new(&cfg.server_endpoint, timeout, cfg.prefer_ipv6),
        report_interval: cfg.report_interval(),
    };

    let shutdown_token = CancellationToken::new();
    tokio::spawn({
        let shutdown_token = shutdown_token.clone();
        async move {
            shutdown_signal().await;
            shutdown_token.cancel();
        }
    });

    agent.run(shutdown_token).await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
