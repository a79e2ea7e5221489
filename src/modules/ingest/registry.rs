use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::shared::db::models::{Gateway, GatewayStatus};
use crate::shared::db::store::GatewayStore;
use crate::shared::errors::RegistryError;

/// One gateway identified by the slugs it publishes under.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayKey {
    pub tenant: String,
    pub building: String,
    pub gateway: String,
}

impl GatewayKey {
    fn matches(&self, tenant: &str, building: &str, gateway: &str) -> bool {
        self.tenant == tenant && self.building == building && self.gateway == gateway
    }
}

/// Decides whether an unknown gateway may be created on first contact.
///
/// ```toml
/// [ingest.registration]
/// mode = "allow_list"
/// gateways = [{ tenant = "acme", building = "tower-1", gateway = "gw-07" }]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RegistrationPolicy {
    /// Create tenant, building and gateway on first contact.
    #[default]
    Auto,
    /// Create only the listed gateways. Already known gateways always pass.
    AllowList {
        #[serde(default)]
        gateways: Vec<GatewayKey>,
    },
    /// Never create anything.
    KnownOnly,
}

impl RegistrationPolicy {
    fn may_create(&self, tenant: &str, building: &str, gateway: &str) -> bool {
        match self {
            RegistrationPolicy::Auto => true,
            RegistrationPolicy::AllowList { gateways } => gateways
                .iter()
                .any(|key| key.matches(tenant, building, gateway)),
            RegistrationPolicy::KnownOnly => false,
        }
    }
}

pub struct GatewayRegistry {
    store: Arc<dyn GatewayStore>,
    policy: RegistrationPolicy,
}

impl GatewayRegistry {
    pub fn new(store: Arc<dyn GatewayStore>, policy: RegistrationPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &RegistrationPolicy {
        &self.policy
    }

    /// Returns the gateway for the triple and touches its `last_seen_at`.
    ///
    /// Missing tenant, building or gateway records are created when the policy
    /// allows it; otherwise the gateway must already exist.
    pub async fn resolve(
        &self,
        tenant: &str,
        building: &str,
        gateway: &str,
        now: DateTime<Utc>,
    ) -> Result<Gateway, RegistryError> {
        if self.policy.may_create(tenant, building, gateway) {
            let tenant_rec = self.store.upsert_tenant(tenant).await?;
            let building_rec = self.store.upsert_building(&tenant_rec.id, building).await?;
            let gw = self
                .store
                .upsert_gateway(&tenant_rec.id, &building_rec.id, gateway, now)
                .await?;
            return Ok(gw);
        }

        let not_registered = || RegistryError::NotRegistered {
            tenant: tenant.to_string(),
            building: building.to_string(),
            gateway: gateway.to_string(),
        };

        let tenant_rec = self
            .store
            .find_tenant(tenant)
            .await?
            .ok_or_else(not_registered)?;
        let building_rec = self
            .store
            .find_building(&tenant_rec.id, building)
            .await?
            .ok_or_else(not_registered)?;
        if self
            .store
            .find_gateway(&tenant_rec.id, &building_rec.id, gateway)
            .await?
            .is_none()
        {
            return Err(not_registered());
        }

        Ok(self
            .store
            .upsert_gateway(&tenant_rec.id, &building_rec.id, gateway, now)
            .await?)
    }

    pub async fn set_status(
        &self,
        gateway: &Gateway,
        status: GatewayStatus,
    ) -> Result<(), RegistryError> {
        self.store.set_gateway_status(&gateway.id, status).await?;
        log::debug!(
            "gateway {} ({}) is now {}",
            gateway.gateway_id,
            gateway.id,
            status
        );
        Ok(())
    }
}
