use std::time::Duration;

use log::{debug, error, info};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{
    netinfo::NetworkQuerent,
    payload::PayloadBuilder,
    probe::Prober,
    report::{self, Reporter},
};

/// Drives the probe → sleep → report cycle and owns the probe result slots.
#[derive(Debug)]
pub struct Agent {
    pub prober: Prober,
    pub querent: NetworkQuerent,
    pub builder: PayloadBuilder,
    pub reporter: Reporter,
    pub report_interval: Duration,
}

impl Agent {
    /// Run until `shutdown` is cancelled. Cancellation is only observed while sleeping,
    /// in-flight probes and reports are left to finish or time out.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            "Starting agent: {} probe target(s), report every {:?}",
            self.prober.slots().len(),
            self.report_interval
        );
        debug!("Local interfaces: {:?}", NetworkQuerent::query_interfaces());

        loop {
            self.prober.fire();

            debug!("Sleep for {:?}", self.report_interval);
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutting down");
                    return;
                }
                _ = sleep(self.report_interval) => { /* continue */ }
            }

            self.report_cycle().await;
        }
    }

    /// Build a report from whatever probe results are resident and send it once.
    pub async fn report_cycle(&self) {
        let snapshot = self.querent.query_snapshot().await;
        let payload = self.builder.build(snapshot, self.prober.slots().snapshot());

        match self.reporter.send(&payload).await {
            Ok(status) => {
                info!("Response status code: {status}");
                report::analyze_response(status);
            }
            Err(e) => error!("Error while sending info. Details: {e:#}"),
        }
    }
}
