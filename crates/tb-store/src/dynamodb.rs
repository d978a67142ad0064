//! DynamoDB-backed Store, grounded in the teacher's `tb-queue::sqs` module
//! use of `aws-sdk-sqs`: builder-pattern client calls, `map_err` into the
//! crate's own error enum. Conditional put uses `attribute_not_exists`
//! (spec.md §4.1's `KeyAlreadyExists`); TTL rides the table's native TTL
//! attribute on `expiration` (spec.md §6).

use async_trait::async_trait;
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tracing::debug;

use tb_common::{ResultStatus, SerialisedMessage, StoreItem};

use crate::{Result, StatusStore, StoreError};

pub struct DynamoDbStore {
    client: Client,
    table_name: String,
}

impl DynamoDbStore {
    pub fn new(client: Client, table_name: impl Into<String>) -> Self {
        Self {
            client,
            table_name: table_name.into(),
        }
    }

    fn status_to_av(status: ResultStatus) -> AttributeValue {
        AttributeValue::S(status.as_str().to_string())
    }

    fn status_from_str(message_id: &str, raw: &str) -> Result<ResultStatus> {
        match raw {
            "submitted" => Ok(ResultStatus::Submitted),
            "in_progress" => Ok(ResultStatus::InProgress),
            "success" => Ok(ResultStatus::Success),
            "error" => Ok(ResultStatus::Error),
            other => Err(StoreError::Unparseable(
                message_id.to_string(),
                format!("unknown status {other}"),
            )),
        }
    }

    fn item_to_attrs(item: &StoreItem) -> Result<HashMap<String, AttributeValue>> {
        let mut attrs = HashMap::new();
        attrs.insert(
            "message_id".to_string(),
            AttributeValue::S(item.message_id.clone()),
        );
        attrs.insert("status".to_string(), Self::status_to_av(item.status));
        attrs.insert(
            "updated_at".to_string(),
            AttributeValue::N(item.updated_at.timestamp().to_string()),
        );
        if let Some(result) = &item.result {
            attrs.insert(
                "result".to_string(),
                AttributeValue::S(serde_json::to_string(result)?),
            );
        }
        if let Some(error) = &item.error {
            attrs.insert("error".to_string(), AttributeValue::S(error.clone()));
        }
        if let Some(request_id) = &item.request_id {
            attrs.insert(
                "request_id".to_string(),
                AttributeValue::S(request_id.clone()),
            );
        }
        if let Some(serialised_message) = &item.serialised_message {
            attrs.insert(
                "serialised_message".to_string(),
                AttributeValue::S(serde_json::to_string(serialised_message)?),
            );
        }
        if let Some(expiration) = item.expiration {
            attrs.insert(
                "expiration".to_string(),
                AttributeValue::N(expiration.timestamp().to_string()),
            );
        }
        Ok(attrs)
    }

    fn attrs_to_item(
        message_id: &str,
        attrs: &HashMap<String, AttributeValue>,
    ) -> Result<StoreItem> {
        let status_raw = attrs
            .get("status")
            .and_then(|v| v.as_s().ok())
            .ok_or_else(|| StoreError::Unparseable(message_id.to_string(), "missing status".into()))?;
        let status = Self::status_from_str(message_id, status_raw)?;

        let updated_at_n = attrs
            .get("updated_at")
            .and_then(|v| v.as_n().ok())
            .ok_or_else(|| StoreError::Unparseable(message_id.to_string(), "missing updated_at".into()))?;
        let updated_at_ts: i64 = updated_at_n
            .parse()
            .map_err(|_| StoreError::Unparseable(message_id.to_string(), "bad updated_at".into()))?;
        let updated_at = DateTime::<Utc>::from_timestamp(updated_at_ts, 0)
            .ok_or_else(|| StoreError::Unparseable(message_id.to_string(), "bad updated_at".into()))?;

        let result = attrs
            .get("result")
            .and_then(|v| v.as_s().ok())
            .map(|s| serde_json::from_str(s))
            .transpose()
            .map_err(|e: serde_json::Error| StoreError::Unparseable(message_id.to_string(), e.to_string()))?;

        let error = attrs.get("error").and_then(|v| v.as_s().ok()).cloned();
        let request_id = attrs.get("request_id").and_then(|v| v.as_s().ok()).cloned();

        let serialised_message: Option<SerialisedMessage> = attrs
            .get("serialised_message")
            .and_then(|v| v.as_s().ok())
            .map(|s| serde_json::from_str(s))
            .transpose()
            .map_err(|e: serde_json::Error| StoreError::Unparseable(message_id.to_string(), e.to_string()))?;

        let expiration = attrs
            .get("expiration")
            .and_then(|v| v.as_n().ok())
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0));

        let mut item = StoreItem::new(
            message_id,
            status,
            result,
            error,
            request_id,
            serialised_message,
            expiration,
        )
        .map_err(|e| StoreError::Unparseable(message_id.to_string(), e.to_string()))?;
        item.updated_at = updated_at;
        Ok(item)
    }
}

#[async_trait]
impl StatusStore for DynamoDbStore {
    async fn put_item(&self, item: StoreItem, allow_overwrite: bool) -> Result<()> {
        let attrs = Self::item_to_attrs(&item)?;

        let mut request = self
            .client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(attrs));

        if !allow_overwrite {
            request = request.condition_expression("attribute_not_exists(message_id)");
        }

        let send_result = request.send().await;
        match send_result {
            Ok(_) => {
                debug!(message_id = %item.message_id, status = %item.status, "put item in DynamoDB");
                Ok(())
            }
            Err(e) => {
                if !allow_overwrite && e.as_service_error().is_some_and(|se| se.is_conditional_check_failed_exception()) {
                    Err(StoreError::KeyAlreadyExists(item.message_id))
                } else {
                    Err(StoreError::Backend(e.to_string()))
                }
            }
        }
    }

    async fn get_item(&self, message_id: &str, raise_for_expiry: bool) -> Result<StoreItem> {
        let response = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("message_id", AttributeValue::S(message_id.to_string()))
            .consistent_read(true)
            .send()
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))?;

        let attrs = response
            .item
            .ok_or_else(|| StoreError::KeyNotFound(message_id.to_string()))?;

        let item = Self::attrs_to_item(message_id, &attrs)?;

        if raise_for_expiry && item.is_expired() {
            return Err(StoreError::ExpiredItem(message_id.to_string()));
        }

        Ok(item)
    }
}
