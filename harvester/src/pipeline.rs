use harvester_core::backoff::retry_bounded;
use harvester_core::{Config, Result};
use metrics::histogram;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::gate::RateGate;
use crate::poller::Poller;
use crate::store::Store;

/// How often the runner wakes to consider a cycle; the rate gate decides
/// whether one actually runs.
const TICK: Duration = Duration::from_millis(250);

/// Continuous harvest loop: the in-process stand-in for a host scheduler.
///
/// Drives cycles strictly sequentially; a cycle's failures are already
/// absorbed inside the poller, and sink failures rewind the cursor, so
/// nothing short of shutdown stops the loop.
pub struct Pipeline {
    poller: Poller,
    store: Store,
    gate: RateGate,
    source_key: String,
    config: Config,
    records_processed: i64,
}

impl Pipeline {
    pub fn new(
        poller: Poller,
        store: Store,
        gate: RateGate,
        source_key: String,
        config: Config,
        records_processed: i64,
    ) -> Self {
        Self {
            poller,
            store,
            gate,
            source_key,
            config,
            records_processed,
        }
    }

    pub async fn run(&mut self) -> Result<()> {
        info!(source = %self.source_key, "starting harvest loop");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("shutdown signal received");
                    let _ = shutdown_tx.send(()).await;
                }
                Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
            }
        });

        let mut tick = tokio::time::interval(TICK);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(records = self.records_processed, "shutting down harvest loop");
                    break;
                }

                _ = tick.tick() => {
                    if self.gate.should_run(Instant::now()) {
                        self.run_cycle().await;
                    }
                }
            }
        }

        Ok(())
    }

    async fn run_cycle(&mut self) {
        let cycle_start = Instant::now();
        let resume_point = self.poller.position().clone();

        let batch = self.poller.poll_once().await;
        let Some((_, committed)) = batch.last() else {
            return;
        };
        let committed = committed.clone();

        let write = retry_bounded(
            || self.store.insert_records(&self.source_key, &batch),
            self.config.poll.sink_max_retries,
            self.config.poll.sink_retry_base_delay_ms,
            "insert_records",
        )
        .await;

        match write {
            Ok(inserted) => {
                self.records_processed += inserted as i64;
                if let Err(error) = self
                    .store
                    .save_checkpoint(&self.source_key, &committed, self.records_processed)
                    .await
                {
                    // records are durable; worst case a restart before the
                    // next successful save re-delivers this batch
                    warn!(%error, "checkpoint save failed");
                }
                histogram!("harvester_cycle_duration_ms")
                    .record(cycle_start.elapsed().as_millis() as f64);
                debug!(
                    emitted = batch.len(),
                    inserted,
                    boundary = %committed.boundary,
                    offset = committed.offset,
                    "cycle committed"
                );
            }
            Err(error) => {
                // the batch never reached the sink; rewind so the next cycle
                // re-issues the same query
                warn!(%error, "sink write failed, rewinding cursor");
                self.poller.rewind(resume_point);
            }
        }
    }
}
