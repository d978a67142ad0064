//! SQLite-backed Store for local development and integration tests that
//! don't have AWS credentials, mirroring `tb-queue::sqlite`'s role for the
//! queue side.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{Pool, Row, Sqlite};
use tracing::info;

use tb_common::{ResultStatus, SerialisedMessage, StoreItem};

use crate::{Result, StatusStore, StoreError};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS store_items (
                message_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                result TEXT,
                error TEXT,
                request_id TEXT,
                serialised_message TEXT,
                expiration INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite store schema initialized");
        Ok(())
    }

    async fn item_exists(&self, message_id: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM store_items WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    fn row_to_item(message_id: &str, row: &sqlx::sqlite::SqliteRow) -> Result<StoreItem> {
        let status_str: String = row.get("status");
        let status = match status_str.as_str() {
            "submitted" => ResultStatus::Submitted,
            "in_progress" => ResultStatus::InProgress,
            "success" => ResultStatus::Success,
            "error" => ResultStatus::Error,
            other => {
                return Err(StoreError::Unparseable(
                    message_id.to_string(),
                    format!("unknown status {other}"),
                ))
            }
        };

        let updated_at_ts: i64 = row.get("updated_at");
        let updated_at = DateTime::<Utc>::from_timestamp(updated_at_ts, 0)
            .ok_or_else(|| StoreError::Unparseable(message_id.to_string(), "bad updated_at".into()))?;

        let result_str: Option<String> = row.get("result");
        let result = result_str
            .map(|s| serde_json::from_str::<Value>(&s))
            .transpose()
            .map_err(|e| StoreError::Unparseable(message_id.to_string(), e.to_string()))?;

        let serialised_message_str: Option<String> = row.get("serialised_message");
        let serialised_message = serialised_message_str
            .map(|s| serde_json::from_str::<SerialisedMessage>(&s))
            .transpose()
            .map_err(|e| StoreError::Unparseable(message_id.to_string(), e.to_string()))?;

        let expiration_ts: Option<i64> = row.get("expiration");
        let expiration = expiration_ts.map(|ts| DateTime::<Utc>::from_timestamp(ts, 0).unwrap_or(updated_at));

        let mut item = StoreItem::new(
            message_id,
            status,
            result,
            row.get::<Option<String>, _>("error"),
            row.get::<Option<String>, _>("request_id"),
            serialised_message,
            expiration,
        )
        .map_err(|e| StoreError::Unparseable(message_id.to_string(), e.to_string()))?;
        item.updated_at = updated_at;
        Ok(item)
    }
}

#[async_trait]
impl StatusStore for SqliteStore {
    async fn put_item(&self, item: StoreItem, allow_overwrite: bool) -> Result<()> {
        if !allow_overwrite && self.item_exists(&item.message_id).await? {
            return Err(StoreError::KeyAlreadyExists(item.message_id.clone()));
        }

        let result_str = item
            .result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let serialised_message_str = item
            .serialised_message
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO store_items
                (message_id, status, updated_at, result, error, request_id, serialised_message, expiration)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(message_id) DO UPDATE SET
                status = excluded.status,
                updated_at = excluded.updated_at,
                result = excluded.result,
                error = excluded.error,
                request_id = excluded.request_id,
                serialised_message = excluded.serialised_message,
                expiration = excluded.expiration
            "#,
        )
        .bind(&item.message_id)
        .bind(item.status.as_str())
        .bind(item.updated_at.timestamp())
        .bind(result_str)
        .bind(&item.error)
        .bind(&item.request_id)
        .bind(serialised_message_str)
        .bind(item.expiration.map(|e| e.timestamp()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_item(&self, message_id: &str, raise_for_expiry: bool) -> Result<StoreItem> {
        let row = sqlx::query("SELECT * FROM store_items WHERE message_id = ?")
            .bind(message_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StoreError::KeyNotFound(message_id.to_string()))?;

        let item = Self::row_to_item(message_id, &row)?;

        if raise_for_expiry && item.is_expired() {
            return Err(StoreError::ExpiredItem(message_id.to_string()));
        }

        Ok(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sqlx::sqlite::SqlitePoolOptions;
    use std::time::Duration as StdDuration;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    #[tokio::test]
    async fn put_result_then_get_result_round_trips() {
        let store = store().await;
        store
            .put_result("m-1", json!({"ok": true}), Some("r-1".into()), None)
            .await
            .unwrap();

        let (result, request_id) = store.get_result("m-1", true).await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(request_id, Some("r-1".into()));
    }

    #[tokio::test]
    async fn get_result_on_in_progress_row_is_a_poll_continue_error() {
        let store = store().await;
        store
            .put_status(ResultStatus::InProgress, "m-2", Some(60), None, None, None)
            .await
            .unwrap();

        let err = store.get_result("m-2", false).await.unwrap_err();
        assert!(matches!(err, StoreError::ResultInProgressStatus(_, _)));
    }

    #[tokio::test]
    async fn get_result_on_error_row_surfaces_the_message() {
        let store = store().await;
        store
            .put_error("m-3", "boom".to_string(), Some(60), None, None)
            .await
            .unwrap();

        let err = store.get_result("m-3", false).await.unwrap_err();
        match err {
            StoreError::ResultErrorStatus(_, msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn expired_in_progress_row_fails_get_item_and_collapses_status_to_error() {
        let store = store().await;
        store
            .put_status(ResultStatus::InProgress, "m-4", Some(1), None, None, None)
            .await
            .unwrap();

        tokio::time::sleep(StdDuration::from_millis(1100)).await;

        let err = store.get_item("m-4", true).await.unwrap_err();
        assert!(matches!(err, StoreError::ExpiredItem(_)));

        let status = store.get_status("m-4").await.unwrap();
        assert_eq!(status, ResultStatus::Error);
    }

    #[tokio::test]
    async fn put_item_rejects_overwrite_when_disallowed() {
        let store = store().await;
        store
            .put_status(ResultStatus::Submitted, "m-5", Some(60), None, None, None)
            .await
            .unwrap();

        let item = StoreItem::new("m-5", ResultStatus::Submitted, None, None, None, None, None).unwrap();
        let err = store.put_item(item, false).await.unwrap_err();
        assert!(matches!(err, StoreError::KeyAlreadyExists(_)));
    }

    #[tokio::test]
    async fn poll_result_times_out_when_never_completed() {
        let store = store().await;
        store
            .put_status(ResultStatus::Submitted, "m-6", Some(60), None, None, None)
            .await
            .unwrap();

        let err = store
            .poll_result("m-6", 0.2, 0.05, false)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AwaitingResultTimeout(_, _)));
    }

    #[tokio::test]
    async fn result_exists_is_false_before_success() {
        let store = store().await;
        store
            .put_status(ResultStatus::Submitted, "m-7", Some(60), None, None, None)
            .await
            .unwrap();
        assert!(!store.result_exists("m-7").await);

        store
            .put_result("m-7", json!(1), None, None)
            .await
            .unwrap();
        assert!(store.result_exists("m-7").await);
    }
}
