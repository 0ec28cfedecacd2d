use metrics::{counter, histogram};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::auth::CredentialManager;
use crate::cursor::CursorTracker;
use crate::model::{EventRecord, Position};
use crate::source::LogSource;

/// Orchestrates one fetch cycle: token, query, fetch, cursor advancement.
///
/// `poll_once` never fails. A cycle that cannot complete — no usable token,
/// transport failure, rejected credential, undecodable page — degrades to an
/// empty batch with the cursor and cached credential exactly as they were, so
/// the next cycle retries the identical query.
pub struct Poller {
    credentials: CredentialManager,
    source: Arc<dyn LogSource>,
    cursor: CursorTracker,
    batch_size: u32,
}

impl Poller {
    pub fn new(
        credentials: CredentialManager,
        source: Arc<dyn LogSource>,
        cursor: CursorTracker,
        batch_size: u32,
    ) -> Self {
        Self {
            credentials,
            source,
            cursor,
            batch_size,
        }
    }

    pub async fn poll_once(&mut self) -> Vec<(EventRecord, Position)> {
        let Some(token) = self.credentials.obtain_token().await else {
            // no fetch attempt against a dead credential
            return Vec::new();
        };

        let query = self.cursor.current_query(self.batch_size);
        let fetch_start = Instant::now();
        let records = match self.source.fetch_page(&token, &query).await {
            Ok(records) => records,
            Err(error) => {
                counter!("harvester_fetch_failures").increment(1);
                warn!(
                    %error,
                    from_time = %query.from_time,
                    offset = query.offset,
                    "fetch failed, discarding cycle"
                );
                return Vec::new();
            }
        };
        histogram!("harvester_fetch_duration_ms").record(fetch_start.elapsed().as_millis() as f64);

        let mut batch = Vec::with_capacity(records.len());
        for record in records {
            let position = self.cursor.advance(record.server_timestamp);
            batch.push((record, position));
        }

        counter!("harvester_records_emitted").increment(batch.len() as u64);
        debug!(count = batch.len(), "cycle complete");
        batch
    }

    /// Last committed position; the run loop snapshots this before a cycle so
    /// a failed sink write can rewind.
    pub fn position(&self) -> &Position {
        self.cursor.position()
    }

    pub fn rewind(&mut self, position: Position) {
        self.cursor.reset(position);
    }
}
