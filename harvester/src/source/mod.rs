pub mod http;

use async_trait::async_trait;
use harvester_core::Result;

use crate::model::{EventRecord, LogQuery};

/// Page-oriented view over the remote append-only log.
#[async_trait]
pub trait LogSource: Send + Sync {
    /// Fetch one page of records for `query`, sorted by server timestamp
    /// ascending. Decoding is all-or-nothing: a single bad record fails the
    /// whole page so the cursor never advances past it.
    async fn fetch_page(&self, token: &str, query: &LogQuery) -> Result<Vec<EventRecord>>;

    fn source_id(&self) -> &str;
}

pub use http::HttpLogSource;
