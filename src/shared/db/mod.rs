pub mod memory;
pub mod models;
pub mod mongo;
pub mod store;

use bson::{doc, Document};
use mongodb::{
    options::{ClientOptions, IndexOptions, ResolverConfig},
    Client, Database, IndexModel,
};

use super::config::DatabaseConfig;
use super::errors::StoreResult;

pub const TENANTS: &str = "tenants";
pub const BUILDINGS: &str = "buildings";
pub const GATEWAYS: &str = "gateways";
pub const EVENTS: &str = "events";
pub const DEVICE_STATES: &str = "device_states";
pub const PROVISIONING_TOKENS: &str = "provisioning_tokens";

pub async fn get_db(config: &DatabaseConfig) -> StoreResult<Database> {
    // An extra line of code to work around a DNS issue on Windows:
    let options =
        ClientOptions::parse_with_resolver_config(&config.uri, ResolverConfig::cloudflare())
            .await?;
    let client = Client::with_options(options)?;

    Ok(client.database(&config.database))
}

/// Creates the unique indexes the idempotency guarantees rely on.
pub async fn ensure_indexes(db: &Database) -> StoreResult<()> {
    let indexes: [(&str, Document, bool); 6] = [
        (TENANTS, doc! { "slug": 1 }, true),
        (BUILDINGS, doc! { "tenantId": 1, "slug": 1 }, true),
        (
            GATEWAYS,
            doc! { "tenantId": 1, "buildingId": 1, "gatewayId": 1 },
            true,
        ),
        (EVENTS, doc! { "gatewayDbId": 1, "eventId": 1 }, true),
        (DEVICE_STATES, doc! { "gatewayDbId": 1, "key": 1 }, true),
        (
            PROVISIONING_TOKENS,
            doc! { "tenantId": 1, "buildingId": 1, "tokenHash": 1 },
            false,
        ),
    ];

    for (collection, keys, unique) in indexes {
        let model = IndexModel::builder()
            .keys(keys)
            .options(IndexOptions::builder().unique(unique).build())
            .build();
        db.collection::<Document>(collection)
            .create_index(model, None)
            .await?;
        log::debug!("index ensured on {}", collection);
    }

    Ok(())
}
