use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::{
    error::{Error as MongoError, ErrorKind, WriteFailure},
    options::{FindOneAndUpdateOptions, ReturnDocument, UpdateOptions},
    Collection, Database,
};
use serde::de::DeserializeOwned;

use super::models::{
    Building, DeviceState, Event, Gateway, GatewayStatus, ProvisioningToken, RecordOutcome, Tenant,
};
use super::store::{EventStore, GatewayStore, StateStore, TokenStore};
use super::{BUILDINGS, DEVICE_STATES, EVENTS, GATEWAYS, PROVISIONING_TOKENS, TENANTS};
use crate::shared::errors::{StoreError, StoreResult};

const DUPLICATE_KEY: i32 = 11000;

/// Storage backed by the Mongo collections created in [`super::ensure_indexes`].
#[derive(Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    fn collection<T>(&self, name: &str) -> Collection<T> {
        self.db.collection(name)
    }
}

pub(crate) fn is_duplicate_key(err: &MongoError) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

/// `find_one_and_update` with upsert. Two concurrent upserts on a unique index can
/// race; the loser gets a duplicate key error and retries as a plain update.
async fn upsert_one<T>(coll: &Collection<T>, filter: Document, update: Document) -> StoreResult<T>
where
    T: DeserializeOwned + Unpin + Send + Sync,
{
    let options = FindOneAndUpdateOptions::builder()
        .upsert(true)
        .return_document(ReturnDocument::After)
        .build();

    let first = coll
        .find_one_and_update(filter.clone(), update.clone(), options.clone())
        .await;

    let found = match first {
        Err(e) if is_duplicate_key(&e) => {
            log::debug!("upsert race on {}, retrying", coll.name());
            coll.find_one_and_update(filter, update, options).await?
        }
        other => other?,
    };

    found.ok_or_else(|| StoreError::Backend(format!("upsert on {} returned nothing", coll.name())))
}

#[async_trait]
impl GatewayStore for MongoStore {
    async fn find_tenant(&self, slug: &str) -> StoreResult<Option<Tenant>> {
        let coll: Collection<Tenant> = self.collection(TENANTS);
        Ok(coll.find_one(doc! { "slug": slug }, None).await?)
    }

    async fn upsert_tenant(&self, slug: &str) -> StoreResult<Tenant> {
        let coll: Collection<Tenant> = self.collection(TENANTS);
        upsert_one(
            &coll,
            doc! { "slug": slug },
            doc! {
                "$setOnInsert": {
                    "_id": uuid::Uuid::new_v4().to_string(),
                    "name": slug,
                }
            },
        )
        .await
    }

    async fn find_building(&self, tenant_id: &str, slug: &str) -> StoreResult<Option<Building>> {
        let coll: Collection<Building> = self.collection(BUILDINGS);
        Ok(coll
            .find_one(doc! { "tenantId": tenant_id, "slug": slug }, None)
            .await?)
    }

    async fn upsert_building(&self, tenant_id: &str, slug: &str) -> StoreResult<Building> {
        let coll: Collection<Building> = self.collection(BUILDINGS);
        upsert_one(
            &coll,
            doc! { "tenantId": tenant_id, "slug": slug },
            doc! {
                "$setOnInsert": {
                    "_id": uuid::Uuid::new_v4().to_string(),
                    "name": slug,
                }
            },
        )
        .await
    }

    async fn find_gateway(
        &self,
        tenant_id: &str,
        building_id: &str,
        gateway_id: &str,
    ) -> StoreResult<Option<Gateway>> {
        let coll: Collection<Gateway> = self.collection(GATEWAYS);
        Ok(coll
            .find_one(
                doc! {
                    "tenantId": tenant_id,
                    "buildingId": building_id,
                    "gatewayId": gateway_id,
                },
                None,
            )
            .await?)
    }

    async fn upsert_gateway(
        &self,
        tenant_id: &str,
        building_id: &str,
        gateway_id: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Gateway> {
        let coll: Collection<Gateway> = self.collection(GATEWAYS);
        let now = bson::DateTime::from_chrono(now);
        upsert_one(
            &coll,
            doc! {
                "tenantId": tenant_id,
                "buildingId": building_id,
                "gatewayId": gateway_id,
            },
            doc! {
                "$set": { "lastSeenAt": now },
                "$setOnInsert": {
                    "_id": uuid::Uuid::new_v4().to_string(),
                    "name": gateway_id,
                    "status": GatewayStatus::Offline.as_str(),
                    "createdAt": now,
                },
            },
        )
        .await
    }

    async fn set_gateway_status(
        &self,
        gateway_db_id: &str,
        status: GatewayStatus,
    ) -> StoreResult<()> {
        let coll: Collection<Gateway> = self.collection(GATEWAYS);
        let result = coll
            .update_one(
                doc! { "_id": gateway_db_id },
                doc! { "$set": { "status": status.as_str() } },
                None,
            )
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::NotFound(format!("gateway {}", gateway_db_id)));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MongoStore {
    async fn insert_event(&self, event: Event) -> StoreResult<RecordOutcome> {
        let coll: Collection<Event> = self.collection(EVENTS);
        match coll.insert_one(&event, None).await {
            Ok(_) => Ok(RecordOutcome::Inserted),
            Err(e) if is_duplicate_key(&e) => Ok(RecordOutcome::Duplicate),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl StateStore for MongoStore {
    async fn upsert_state(&self, state: DeviceState) -> StoreResult<()> {
        let coll: Collection<DeviceState> = self.collection(DEVICE_STATES);
        let value = bson::to_bson(&state.value)?;

        coll.update_one(
            doc! { "gatewayDbId": &state.gateway_db_id, "key": &state.key },
            doc! {
                "$set": {
                    "tenantId": &state.tenant_id,
                    "buildingId": &state.building_id,
                    "ts": bson::DateTime::from_chrono(state.ts),
                    "value": value,
                    "updatedAt": bson::DateTime::from_chrono(state.updated_at),
                }
            },
            UpdateOptions::builder().upsert(true).build(),
        )
        .await?;
        Ok(())
    }

    async fn get_state(&self, gateway_db_id: &str, key: &str) -> StoreResult<Option<DeviceState>> {
        let coll: Collection<DeviceState> = self.collection(DEVICE_STATES);
        Ok(coll
            .find_one(doc! { "gatewayDbId": gateway_db_id, "key": key }, None)
            .await?)
    }
}

#[async_trait]
impl TokenStore for MongoStore {
    async fn insert_token(&self, token: ProvisioningToken) -> StoreResult<()> {
        let coll: Collection<ProvisioningToken> = self.collection(PROVISIONING_TOKENS);
        coll.insert_one(&token, None).await?;
        Ok(())
    }

    async fn mark_token_used(
        &self,
        tenant_id: &str,
        building_id: &str,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<Option<ProvisioningToken>> {
        let coll: Collection<ProvisioningToken> = self.collection(PROVISIONING_TOKENS);
        let now = bson::DateTime::from_chrono(now);

        // The usedAt: null condition is evaluated inside the same atomic write,
        // so only one caller can flip it.
        let spent = coll
            .find_one_and_update(
                doc! {
                    "tenantId": tenant_id,
                    "buildingId": building_id,
                    "tokenHash": token_hash,
                    "usedAt": null,
                    "expiresAt": { "$gt": now },
                },
                doc! { "$set": { "usedAt": now } },
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await?;
        Ok(spent)
    }
}
