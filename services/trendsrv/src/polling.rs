//! Polling loop: ensure link, read, persist, broadcast, sleep

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::hub::BroadcastHub;
use crate::reader::Reader;
use crate::repository::Repository;

/// Settle time before the first cycle
pub const INITIAL_DELAY: Duration = Duration::from_secs(2);

/// Delay after a failed cycle
pub const RECOVERY_DELAY: Duration = Duration::from_secs(5);

/// What one cycle did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Link unavailable; cycle skipped
    NotConnected,
    /// No enabled points; cycle skipped
    NoPoints,
    /// Batch read, stored and broadcast
    Completed { readings: usize, bad: usize },
}

pub struct PollingScheduler {
    connection: Arc<ConnectionManager>,
    reader: Arc<Reader>,
    repository: Arc<Repository>,
    hub: Arc<BroadcastHub>,
    interval: Duration,
    initial_delay: Duration,
    recovery_delay: Duration,
}

impl PollingScheduler {
    pub fn new(
        connection: Arc<ConnectionManager>,
        reader: Arc<Reader>,
        repository: Arc<Repository>,
        hub: Arc<BroadcastHub>,
        interval: Duration,
    ) -> Self {
        Self {
            connection,
            reader,
            repository,
            hub,
            interval,
            initial_delay: INITIAL_DELAY,
            recovery_delay: RECOVERY_DELAY,
        }
    }

    /// Override the settle and recovery delays
    pub fn with_delays(mut self, initial: Duration, recovery: Duration) -> Self {
        self.initial_delay = initial;
        self.recovery_delay = recovery;
        self
    }

    /// One polling cycle
    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        if !self.connection.is_connected() && !self.connection.ensure_connected().await {
            debug!("Device not connected, skipping cycle");
            return Ok(CycleOutcome::NotConnected);
        }

        let points = self.repository.enabled_points().await?;
        if points.is_empty() {
            debug!("No enabled points, skipping cycle");
            return Ok(CycleOutcome::NoPoints);
        }

        let readings = self.reader.read_all(&points).await?;
        self.repository.persist(&readings).await?;
        self.hub.publish(&readings).await;

        let bad = readings.iter().filter(|r| !r.is_good()).count();
        if bad > 0 {
            warn!("{} of {} points read with bad quality", bad, readings.len());
        }
        Ok(CycleOutcome::Completed {
            readings: readings.len(),
            bad,
        })
    }

    /// Run until `token` is cancelled, then close the link
    pub async fn run(&self, token: CancellationToken) {
        info!("Polling started (interval {:?})", self.interval);

        let mut delay = self.initial_delay;
        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                () = token.cancelled() => break,
            }

            delay = tokio::select! {
                outcome = self.run_cycle() => match outcome {
                    Ok(outcome) => {
                        debug!("Polling cycle: {:?}", outcome);
                        self.interval
                    },
                    Err(e) => {
                        error!("Polling cycle failed: {}", e);
                        self.recovery_delay
                    },
                },
                () = token.cancelled() => break,
            };
        }

        self.connection.disconnect().await;
        info!("Polling stopped");
    }

    pub fn spawn(self: Arc<Self>, token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(token).await })
    }
}
