use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::models::{
    Building, DeviceState, Event, Gateway, GatewayStatus, ProvisioningToken, RecordOutcome, Tenant,
};
use crate::shared::errors::StoreResult;

/// Tenant, building and gateway records.
///
/// Upserts must converge when called concurrently for the same key.
#[async_trait]
pub trait GatewayStore: Send + Sync {
    async fn find_tenant(&self, slug: &str) -> StoreResult<Option<Tenant>>;

    /// Returns the tenant with `slug`, creating it (slug as name) when absent.
    async fn upsert_tenant(&self, slug: &str) -> StoreResult<Tenant>;

    async fn find_building(&self, tenant_id: &str, slug: &str) -> StoreResult<Option<Building>>;

    async fn upsert_building(&self, tenant_id: &str, slug: &str) -> StoreResult<Building>;

    async fn find_gateway(
        &self,
        tenant_id: &str,
        building_id: &str,
        gateway_id: &str,
    ) -> StoreResult<Option<Gateway>>;

    /// Returns the gateway, creating it `offline` when absent; `last_seen_at` is set to `now`
    /// either way.
    async fn upsert_gateway(
        &self,
        tenant_id: &str,
        building_id: &str,
        gateway_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Gateway>;

    async fn set_gateway_status(&self, gateway_db_id: &str, status: GatewayStatus)
        -> StoreResult<()>;
}

/// Append-only event log.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventStore: Send + Sync {
    /// A conflict on (gateway_db_id, event_id) is `Duplicate`, never an error.
    async fn insert_event(&self, event: Event) -> StoreResult<RecordOutcome>;
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last-write-wins upsert keyed by (gateway_db_id, key).
    async fn upsert_state(&self, state: DeviceState) -> StoreResult<()>;

    async fn get_state(&self, gateway_db_id: &str, key: &str) -> StoreResult<Option<DeviceState>>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, token: ProvisioningToken) -> StoreResult<()>;

    /// Atomically marks the usable token matching the scope and hash as used.
    /// Returns the spent token, or `None` when nothing usable matched.
    async fn mark_token_used(
        &self,
        tenant_id: &str,
        building_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ProvisioningToken>>;
}

/// Everything the ingestion pipeline needs from storage.
pub trait IngestStore: GatewayStore + EventStore + StateStore + TokenStore {}

impl<T: GatewayStore + EventStore + StateStore + TokenStore> IngestStore for T {}
