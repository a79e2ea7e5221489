use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::Arc;

use crate::shared::db::models::{DeviceState, Gateway};
use crate::shared::db::store::StateStore;
use crate::shared::errors::StoreResult;

/// Latest value per (gateway, key). Writes are unconditional: the last one to
/// arrive wins, whatever its `ts`.
pub struct DeviceStates {
    store: Arc<dyn StateStore>,
}

impl DeviceStates {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    pub async fn set_state(
        &self,
        gateway: &Gateway,
        key: &str,
        ts: DateTime<Utc>,
        value: Value,
    ) -> StoreResult<()> {
        self.store
            .upsert_state(DeviceState {
                tenant_id: gateway.tenant_id.clone(),
                building_id: gateway.building_id.clone(),
                gateway_db_id: gateway.id.clone(),
                key: key.to_string(),
                ts,
                value,
                updated_at: Utc::now(),
            })
            .await
    }

    pub async fn get(&self, gateway_db_id: &str, key: &str) -> StoreResult<Option<DeviceState>> {
        self.store.get_state(gateway_db_id, key).await
    }
}
