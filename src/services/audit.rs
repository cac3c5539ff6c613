use std::sync::Arc;

use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::models::audit_log::{CreateAuditLogData, RequestContext};
use crate::store::AuditSink;

/// Fire-and-forget audit trail. Sink failures are logged here and never
/// reach the caller.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn AuditSink>,
}

impl AuditRecorder {
    pub fn new(sink: Arc<dyn AuditSink>) -> Self {
        Self { sink }
    }

    pub async fn record(
        &self,
        action: &str,
        details: JsonValue,
        license_id: Option<Uuid>,
        context: &RequestContext,
    ) {
        let data = CreateAuditLogData {
            action: action.to_string(),
            details,
            license_id,
            context: context.clone(),
        };

        if let Err(e) = self.sink.append(data).await {
            tracing::warn!(action, error = %e, "Failed to write audit log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit_log::AuditLog;
    use crate::store::{Page, StoreError, StoreResult};
    use async_trait::async_trait;
    use serde_json::json;

    struct BrokenSink;

    #[async_trait]
    impl AuditSink for BrokenSink {
        async fn append(&self, _data: CreateAuditLogData) -> StoreResult<()> {
            Err(StoreError::Database(sqlx::Error::PoolClosed))
        }

        async fn list_audit_logs(
            &self,
            _license_id: Option<Uuid>,
            _page: Page,
        ) -> StoreResult<Vec<AuditLog>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_sink_failure_is_swallowed() {
        let recorder = AuditRecorder::new(Arc::new(BrokenSink));
        recorder
            .record(
                "validation_failed",
                json!({ "reason": "license_not_found" }),
                None,
                &RequestContext::default(),
            )
            .await;
    }

    #[tokio::test]
    async fn test_record_carries_request_context() {
        let store = Arc::new(crate::store::MemoryStore::new());
        let recorder = AuditRecorder::new(store.clone());
        let license_id = Uuid::new_v4();
        let context = RequestContext {
            ip_address: Some("10.0.0.7".to_string()),
            user_agent: Some("HisaabKitab-POS/2.1".to_string()),
        };

        recorder
            .record("license_created", json!({}), Some(license_id), &context)
            .await;

        let logs = store
            .list_audit_logs(Some(license_id), Page::new(1, 10))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "license_created");
        assert_eq!(logs[0].ip_address.as_deref(), Some("10.0.0.7"));
    }
}
