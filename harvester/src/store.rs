use chrono::{DateTime, Utc};
use harvester_core::{Error, Result};
use metrics::counter;
use sqlx::PgPool;
use tracing::{debug, instrument};

use crate::model::{Checkpoint, EventRecord, Position};

/// Downstream sink plus durable offset storage, both in Postgres.
pub struct Store {
    pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, batch))]
    pub async fn insert_records(
        &self,
        source: &str,
        batch: &[(EventRecord, Position)],
    ) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut timestamps: Vec<DateTime<Utc>> = Vec::with_capacity(batch.len());
        let mut payloads: Vec<serde_json::Value> = Vec::with_capacity(batch.len());
        let mut boundaries: Vec<String> = Vec::with_capacity(batch.len());
        let mut offsets: Vec<i64> = Vec::with_capacity(batch.len());
        for (record, position) in batch {
            timestamps.push(record.server_timestamp.with_timezone(&Utc));
            payloads.push(serde_json::Value::Object(record.payload.clone()));
            boundaries.push(position.boundary.to_rfc3339());
            offsets.push(position.offset as i64);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO event_records (source, server_timestamp, payload, position_boundary, position_offset)
            SELECT $1, t.ts, t.payload, t.boundary, t.ofs
            FROM UNNEST($2::timestamptz[], $3::jsonb[], $4::text[], $5::bigint[]) AS t(ts, payload, boundary, ofs)
            "#,
        )
        .bind(source)
        .bind(&timestamps)
        .bind(&payloads)
        .bind(&boundaries)
        .bind(&offsets)
        .execute(&self.pool)
        .await?
        .rows_affected() as usize;

        counter!("harvester_records_stored").increment(inserted as u64);
        debug!(total = batch.len(), inserted, "inserted records");
        Ok(inserted)
    }

    pub async fn load_checkpoint(&self, source: &str) -> Result<Option<Checkpoint>> {
        let row: Option<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT position_boundary, position_offset, records_processed
            FROM checkpoints WHERE source = $1
            "#,
        )
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((boundary, offset, records_processed)) => {
                let boundary = DateTime::parse_from_rfc3339(&boundary).map_err(|e| {
                    Error::Checkpoint(format!("stored boundary {boundary:?} unreadable: {e}"))
                })?;
                Ok(Some(Checkpoint {
                    position: Position::new(boundary, offset as u64),
                    records_processed,
                }))
            }
            None => Ok(None),
        }
    }

    pub async fn save_checkpoint(
        &self,
        source: &str,
        position: &Position,
        records_processed: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO checkpoints (source, position_boundary, position_offset, records_processed, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (source) DO UPDATE
            SET position_boundary = EXCLUDED.position_boundary,
                position_offset = EXCLUDED.position_offset,
                records_processed = EXCLUDED.records_processed,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(source)
        .bind(position.boundary.to_rfc3339())
        .bind(position.offset as i64)
        .bind(records_processed)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
