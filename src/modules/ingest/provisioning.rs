use chrono::{DateTime, Duration, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::sync::Arc;

use crate::shared::db::models::ProvisioningToken;
use crate::shared::db::store::TokenStore;
use crate::shared::errors::StoreResult;

const TOKEN_BYTES: usize = 24;

pub fn default_token_ttl() -> Duration {
    Duration::hours(24)
}

/// Hex encoded SHA-256 of a raw token. Only hashes are ever stored.
pub fn hash_token(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Single-use tokens scoped to one tenant and building.
pub struct ProvisioningTokens {
    store: Arc<dyn TokenStore>,
}

impl ProvisioningTokens {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self { store }
    }

    /// Spends `candidate` if it matches a usable token of the scope.
    /// Returns true only for the caller that actually spent it.
    pub async fn consume(
        &self,
        tenant_id: &str,
        building_id: &str,
        candidate: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let spent = self
            .store
            .mark_token_used(tenant_id, building_id, &hash_token(candidate), now)
            .await?;
        Ok(spent.is_some())
    }

    /// Creates a token valid for `ttl` and returns the raw value with the stored record.
    /// The raw value is not recoverable afterwards.
    pub async fn issue(
        &self,
        tenant_id: &str,
        building_id: &str,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<(String, ProvisioningToken)> {
        let raw = generate_token();
        let token = ProvisioningToken {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant_id.to_string(),
            building_id: building_id.to_string(),
            token_hash: hash_token(&raw),
            expires_at: now + ttl,
            used_at: None,
        };
        self.store.insert_token(token.clone()).await?;
        Ok((raw, token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::db::memory::MemoryStore;

    fn tokens() -> (Arc<MemoryStore>, ProvisioningTokens) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), ProvisioningTokens::new(store))
    }

    #[test]
    fn test_hash_is_sha256_hex() {
        assert_eq!(
            hash_token("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_issued_token_shape() {
        let (store, tokens) = tokens();
        let now = Utc::now();
        let (raw, token) = tokens.issue("t", "b", default_token_ttl(), now).await.unwrap();

        assert_eq!(raw.len(), TOKEN_BYTES * 2);
        assert!(raw.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token.token_hash, hash_token(&raw));
        assert_eq!(token.expires_at, now + Duration::hours(24));
        assert_eq!(store.tokens().await.len(), 1);
    }

    #[tokio::test]
    async fn test_token_is_consumed_once() {
        let (store, tokens) = tokens();
        let now = Utc::now();
        let (raw, _) = tokens.issue("t", "b", default_token_ttl(), now).await.unwrap();

        assert!(tokens.consume("t", "b", &raw, now).await.unwrap());
        assert!(!tokens.consume("t", "b", &raw, now).await.unwrap());
        assert!(store.tokens().await[0].used_at.is_some());
    }

    #[tokio::test]
    async fn test_expired_token_is_rejected() {
        let (store, tokens) = tokens();
        let now = Utc::now();
        let (raw, _) = tokens.issue("t", "b", Duration::minutes(1), now).await.unwrap();

        let later = now + Duration::minutes(2);
        assert!(!tokens.consume("t", "b", &raw, later).await.unwrap());
        assert!(store.tokens().await[0].used_at.is_none());
    }

    #[tokio::test]
    async fn test_wrong_scope_and_wrong_token_are_rejected() {
        let (_, tokens) = tokens();
        let now = Utc::now();
        let (raw, _) = tokens.issue("t", "b", default_token_ttl(), now).await.unwrap();

        assert!(!tokens.consume("t", "other", &raw, now).await.unwrap());
        assert!(!tokens.consume("other", "b", &raw, now).await.unwrap());
        assert!(!tokens.consume("t", "b", "not-the-token", now).await.unwrap());
        assert!(tokens.consume("t", "b", &raw, now).await.unwrap());
    }

    #[tokio::test]
    async fn test_concurrent_consumers_spend_once() {
        let (_, tokens) = tokens();
        let tokens = Arc::new(tokens);
        let now = Utc::now();
        let (raw, _) = tokens.issue("t", "b", default_token_ttl(), now).await.unwrap();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let tokens = tokens.clone();
                let raw = raw.clone();
                tokio::spawn(async move { tokens.consume("t", "b", &raw, now).await.unwrap() })
            })
            .collect();

        let mut spent = 0;
        for handle in handles {
            if handle.await.unwrap() {
                spent += 1;
            }
        }
        assert_eq!(spent, 1);
    }
}
