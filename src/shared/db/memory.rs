use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::models::{
    Building, DeviceState, Event, Gateway, GatewayStatus, ProvisioningToken, RecordOutcome, Tenant,
};
use super::store::{EventStore, GatewayStore, StateStore, TokenStore};
use crate::shared::errors::{StoreError, StoreResult};

#[derive(Default)]
struct Tables {
    tenants: HashMap<String, Tenant>,
    // (tenant_id, slug)
    buildings: HashMap<(String, String), Building>,
    // (tenant_id, building_id, gateway_id)
    gateways: HashMap<(String, String, String), Gateway>,
    // (gateway_db_id, event_id)
    events: HashMap<(String, String), Event>,
    // (gateway_db_id, key)
    states: HashMap<(String, String), DeviceState>,
    tokens: Vec<ProvisioningToken>,
}

/// Process-local store with the same uniqueness rules as the Mongo indexes.
///
/// Every operation takes the table lock once, so upserts and conditional updates
/// are atomic with respect to each other.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        let tables = self.tables.read().await;
        let mut events: Vec<Event> = tables.events.values().cloned().collect();
        events.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        events
    }

    pub async fn gateways(&self) -> Vec<Gateway> {
        self.tables.read().await.gateways.values().cloned().collect()
    }

    pub async fn tokens(&self) -> Vec<ProvisioningToken> {
        self.tables.read().await.tokens.clone()
    }
}

#[async_trait]
impl GatewayStore for MemoryStore {
    async fn find_tenant(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        Ok(self.tables.read().await.tenants.get(slug).cloned())
    }

    async fn upsert_tenant(&self, slug: &str) -> StoreResult<Tenant> {
        let mut tables = self.tables.write().await;
        let tenant = tables
            .tenants
            .entry(slug.to_string())
            .or_insert_with(|| Tenant {
                id: uuid::Uuid::new_v4().to_string(),
                slug: slug.to_string(),
                name: slug.to_string(),
            });
        Ok(tenant.clone())
    }

    async fn find_building(&self, tenant_id: &str, slug: &str) -> StoreResult<Option<Building>> {
        let key = (tenant_id.to_string(), slug.to_string());
        Ok(self.tables.read().await.buildings.get(&key).cloned())
    }

    async fn upsert_building(&self, tenant_id: &str, slug: &str) -> StoreResult<Building> {
        let mut tables = self.tables.write().await;
        let building = tables
            .buildings
            .entry((tenant_id.to_string(), slug.to_string()))
            .or_insert_with(|| Building {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                slug: slug.to_string(),
                name: slug.to_string(),
            });
        Ok(building.clone())
    }

    async fn find_gateway(
        &self,
        tenant_id: &str,
        building_id: &str,
        gateway_id: &str,
    ) -> StoreResult<Option<Gateway>> {
        let key = (
            tenant_id.to_string(),
            building_id.to_string(),
            gateway_id.to_string(),
        );
        Ok(self.tables.read().await.gateways.get(&key).cloned())
    }

    async fn upsert_gateway(
        &self,
        tenant_id: &str,
        building_id: &str,
        gateway_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Gateway> {
        let mut tables = self.tables.write().await;
        let gateway = tables
            .gateways
            .entry((
                tenant_id.to_string(),
                building_id.to_string(),
                gateway_id.to_string(),
            ))
            .or_insert_with(|| Gateway {
                id: uuid::Uuid::new_v4().to_string(),
                tenant_id: tenant_id.to_string(),
                building_id: building_id.to_string(),
                gateway_id: gateway_id.to_string(),
                name: gateway_id.to_string(),
                status: GatewayStatus::Offline,
                last_seen_at: now,
                created_at: now,
            });
        gateway.last_seen_at = now;
        Ok(gateway.clone())
    }

    async fn set_gateway_status(
        &self,
        gateway_db_id: &str,
        status: GatewayStatus,
    ) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let gateway = tables
            .gateways
            .values_mut()
            .find(|g| g.id == gateway_db_id)
            .ok_or_else(|| StoreError::NotFound(format!("gateway {}", gateway_db_id)))?;
        gateway.status = status;
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn insert_event(&self, event: Event) -> StoreResult<RecordOutcome> {
        let mut tables = self.tables.write().await;
        let key = (event.gateway_db_id.clone(), event.event_id.clone());
        if tables.events.contains_key(&key) {
            return Ok(RecordOutcome::Duplicate);
        }
        tables.events.insert(key, event);
        Ok(RecordOutcome::Inserted)
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn upsert_state(&self, state: DeviceState) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .states
            .insert((state.gateway_db_id.clone(), state.key.clone()), state);
        Ok(())
    }

    async fn get_state(&self, gateway_db_id: &str, key: &str) -> StoreResult<Option<DeviceState>> {
        let key = (gateway_db_id.to_string(), key.to_string());
        Ok(self.tables.read().await.states.get(&key).cloned())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, token: ProvisioningToken) -> StoreResult<()> {
        self.tables.write().await.tokens.push(token);
        Ok(())
    }

    async fn mark_token_used(
        &self,
        tenant_id: &str,
        building_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ProvisioningToken>> {
        let mut tables = self.tables.write().await;
        let found = tables.tokens.iter_mut().find(|t| {
            t.tenant_id == tenant_id
                && t.building_id == building_id
                && t.token_hash == token_hash
                && t.is_usable(now)
        });

        Ok(found.map(|token| {
            token.used_at = Some(bson::DateTime::from_chrono(now));
            token.clone()
        }))
    }
}
