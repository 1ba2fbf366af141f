// SQLite-backed event store, enabled with the `database` feature
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use guardrail_core::{EventStore, SecurityAlert, SecurityEvent, StorageError};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};
use std::str::FromStr;
use uuid::Uuid;

/// Rows hold the serialized record plus the columns needed to query it.
/// `seq` keeps insertion order for records sharing a timestamp.
#[derive(Clone, Debug)]
pub struct SqliteEventStore {
    pool: SqlitePool,
}

fn unavailable(e: sqlx::Error) -> StorageError {
    StorageError::Unavailable(e.to_string())
}

impl SqliteEventStore {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(unavailable)?
            .create_if_missing(true);

        // Every connection to an in-memory database is a separate database
        let max_connections = if url.contains(":memory:") { 1 } else { 4 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(unavailable)?;

        let store = Self { pool };
        store.ensure_tables().await?;
        Ok(store)
    }

    async fn ensure_tables(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS security_events (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL,
                ts_micros INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_security_events_ts ON security_events (ts_micros)")
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS security_alerts (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                resolved INTEGER NOT NULL DEFAULT 0,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;

        Ok(())
    }

    async fn load_alert(&self, id: Uuid) -> Result<SecurityAlert, StorageError> {
        let payload: Option<String> = sqlx::query_scalar("SELECT payload FROM security_alerts WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(unavailable)?;

        let payload = payload.ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        Ok(serde_json::from_str(&payload)?)
    }
}

#[async_trait]
impl EventStore for SqliteEventStore {
    async fn append_event(&self, event: &SecurityEvent) -> Result<(), StorageError> {
        let payload = serde_json::to_string(event)?;
        sqlx::query(
            "INSERT INTO security_events (id, ts_micros, event_type, payload) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(event.id.to_string())
        .bind(event.timestamp.timestamp_micros())
        .bind(event.event_type.as_str())
        .bind(payload)
        .execute(&self.pool)
        .await
        .map_err(unavailable)?;
        Ok(())
    }

    async fn events_between(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<SecurityEvent>, StorageError> {
        let rows: Vec<String> = sqlx::query_scalar(
            "SELECT payload FROM security_events WHERE ts_micros >= ?1 AND ts_micros < ?2 ORDER BY ts_micros, seq",
        )
        .bind(from.timestamp_micros())
        .bind(to.timestamp_micros())
        .fetch_all(&self.pool)
        .await
        .map_err(unavailable)?;

        rows.iter()
            .map(|payload| serde_json::from_str(payload).map_err(StorageError::from))
            .collect()
    }

    async fn append_alert(&self, alert: &SecurityAlert) -> Result<(), StorageError> {
        let payload = serde_json::to_string(alert)?;
        sqlx::query("INSERT INTO security_alerts (id, resolved, payload) VALUES (?1, ?2, ?3)")
            .bind(alert.id.to_string())
            .bind(alert.resolved)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;
        Ok(())
    }

    async fn alerts(&self, unresolved_only: bool) -> Result<Vec<SecurityAlert>, StorageError> {
        let sql = if unresolved_only {
            "SELECT payload FROM security_alerts WHERE resolved = 0 ORDER BY seq DESC"
        } else {
            "SELECT payload FROM security_alerts ORDER BY seq DESC"
        };
        let rows: Vec<String> = sqlx::query_scalar(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(unavailable)?;

        rows.iter()
            .map(|payload| serde_json::from_str(payload).map_err(StorageError::from))
            .collect()
    }

    async fn resolve_alert(
        &self,
        id: Uuid,
        resolved_at: DateTime<Utc>,
    ) -> Result<SecurityAlert, StorageError> {
        let mut alert = self.load_alert(id).await?;
        if alert.resolved {
            return Ok(alert);
        }

        alert.resolved = true;
        alert.resolved_at = Some(resolved_at);
        let payload = serde_json::to_string(&alert)?;

        sqlx::query("UPDATE security_alerts SET resolved = 1, payload = ?1 WHERE id = ?2 AND resolved = 0")
            .bind(payload)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(unavailable)?;

        // A concurrent resolve may have won; report what is stored
        self.load_alert(id).await
    }
}
