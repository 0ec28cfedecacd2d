use async_trait::async_trait;
use harvester_core::{Error, Result};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, instrument};

use super::LogSource;
use crate::model::{EventRecord, LogQuery};

#[derive(Debug, Deserialize)]
struct LogPage {
    #[serde(default)]
    events: Vec<Value>,
}

/// `GET {base}/log` client with bearer authentication.
pub struct HttpLogSource {
    http: Client,
    base_url: String,
}

impl HttpLogSource {
    pub fn new(http: Client, base_url: String) -> Self {
        Self { http, base_url }
    }

    fn decode_page(page: LogPage) -> Result<Vec<EventRecord>> {
        page.events.into_iter().map(EventRecord::from_value).collect()
    }
}

#[async_trait]
impl LogSource for HttpLogSource {
    #[instrument(skip(self, token), fields(from_time = %query.from_time, offset = query.offset))]
    async fn fetch_page(&self, token: &str, query: &LogQuery) -> Result<Vec<EventRecord>> {
        let url = format!("{}/log", self.base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(token)
            .query(&[
                ("from_time", query.from_time.to_rfc3339()),
                ("offset", query.offset.to_string()),
                ("limit", query.limit.to_string()),
                ("order", "server_timestamp".to_string()),
            ])
            .send()
            .await
            .map_err(|e| Error::Fetch {
                details: e.to_string(),
            })?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(Error::Fetch {
                details: format!("credential rejected by server ({status})"),
            });
        }
        if !status.is_success() {
            return Err(Error::Fetch {
                details: format!("server returned {status}"),
            });
        }

        let page: LogPage = response.json().await.map_err(|e| Error::Fetch {
            details: format!("bad page body: {e}"),
        })?;

        let records = Self::decode_page(page)?;
        debug!(count = records.len(), "fetched log page");
        Ok(records)
    }

    fn source_id(&self) -> &str {
        &self.base_url
    }
}
