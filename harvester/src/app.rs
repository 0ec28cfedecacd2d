use harvester_core::{Config, Result};
use reqwest::Client;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::auth::{CredentialManager, HttpAuthClient, Principal};
use crate::cursor::CursorTracker;
use crate::gate::RateGate;
use crate::model::Position;
use crate::pipeline::Pipeline;
use crate::poller::Poller;
use crate::source::HttpLogSource;
use crate::store::Store;

pub struct App {
    pipeline: Pipeline,
}

impl App {
    #[instrument(skip(config, pool))]
    pub async fn new(config: Config, pool: PgPool) -> Result<Self> {
        info!("initializing harvester");

        let store = Store::new(pool);
        store.health_check().await?;

        let http = Client::builder()
            .timeout(Duration::from_secs(config.source.request_timeout_secs))
            .build()?;

        let principal = Principal {
            username: config.source.username.clone(),
            password: config.source.password.clone(),
            scope: config.source.scope.clone(),
            client_id: config.source.client_id.clone(),
        };
        let credentials = CredentialManager::new(
            Arc::new(HttpAuthClient::new(http.clone(), config.source.base_url.clone())),
            principal,
        );
        let source = Arc::new(HttpLogSource::new(http, config.source.base_url.clone()));

        // checkpoints are keyed by source identity; parallel partitions each
        // get their own key, poller and credential manager
        let source_key = config.source.base_url.clone();
        let checkpoint = store.load_checkpoint(&source_key).await?;
        let records_processed = checkpoint.as_ref().map_or(0, |c| c.records_processed);

        let cursor = match &checkpoint {
            Some(checkpoint) => {
                info!(
                    boundary = %checkpoint.position.boundary,
                    offset = checkpoint.position.offset,
                    "resuming from checkpoint"
                );
                CursorTracker::resume(Some(checkpoint.position.clone()))
            }
            None => match config.poll.start_from {
                Some(start) => {
                    info!(start = %start, "no checkpoint, starting from configured boundary");
                    CursorTracker::resume(Some(Position::new(start.fixed_offset(), 0)))
                }
                None => {
                    info!("no checkpoint, starting from the default boundary");
                    CursorTracker::resume(None)
                }
            },
        };

        let poller = Poller::new(credentials, source, cursor, config.poll.batch_size);
        let gate = RateGate::new(Duration::from_millis(config.poll.min_interval_ms));
        let pipeline = Pipeline::new(poller, store, gate, source_key, config, records_processed);

        Ok(Self { pipeline })
    }

    pub async fn run(mut self) -> Result<()> {
        self.pipeline.run().await
    }
}
