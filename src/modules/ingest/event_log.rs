use std::sync::Arc;

use crate::shared::db::models::{Event, RecordOutcome};
use crate::shared::db::store::EventStore;
use crate::shared::errors::StoreResult;

/// Idempotent append of inbound messages, keyed by (gateway, event id).
pub struct EventLog {
    store: Arc<dyn EventStore>,
}

impl EventLog {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, event: Event) -> StoreResult<RecordOutcome> {
        let event_id = event.event_id.clone();
        let gateway_db_id = event.gateway_db_id.clone();

        let outcome = self.store.insert_event(event).await?;
        if outcome == RecordOutcome::Duplicate {
            log::debug!(
                "event {} of gateway {} already recorded",
                event_id,
                gateway_db_id
            );
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::mqtt::topic::Channel;
    use crate::shared::db::memory::MemoryStore;
    use chrono::Utc;
    use serde_json::json;

    fn event(gateway_db_id: &str, event_id: &str) -> Event {
        let now = Utc::now();
        Event {
            id: uuid::Uuid::new_v4().to_string(),
            event_id: event_id.to_string(),
            tenant_id: "t".to_string(),
            building_id: "b".to_string(),
            gateway_db_id: gateway_db_id.to_string(),
            type_: "door/open".to_string(),
            channel: Channel::Evt,
            topic: "rentio/v1/t/b/gw/g/evt/door/open".to_string(),
            ts: now,
            payload: json!({"id": event_id}),
            created_at: now,
        }
    }

    #[tokio::test]
    async fn test_second_insert_is_duplicate() {
        let store = Arc::new(MemoryStore::new());
        let log = EventLog::new(store.clone());

        assert_eq!(log.record(event("gw-a", "e-1")).await.unwrap(), RecordOutcome::Inserted);
        assert_eq!(log.record(event("gw-a", "e-1")).await.unwrap(), RecordOutcome::Duplicate);
        assert_eq!(store.events().await.len(), 1);
    }

    #[tokio::test]
    async fn test_same_id_on_other_gateway_is_distinct() {
        let store = Arc::new(MemoryStore::new());
        let log = EventLog::new(store.clone());

        assert_eq!(log.record(event("gw-a", "e-1")).await.unwrap(), RecordOutcome::Inserted);
        assert_eq!(log.record(event("gw-b", "e-1")).await.unwrap(), RecordOutcome::Inserted);
        assert_eq!(store.events().await.len(), 2);
    }
}
