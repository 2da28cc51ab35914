//! In-process store.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{AuthorizedClient, AuthorizedClientStore, Result, StoreError};
use crate::session::types::{ClientKey, TokenPair};

/// Authorized clients held in memory. Lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    clients: RwLock<HashMap<ClientKey, AuthorizedClient>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }
}

#[async_trait]
impl AuthorizedClientStore for MemoryStore {
    async fn load(&self, key: &ClientKey) -> Result<Option<AuthorizedClient>> {
        Ok(self.clients.read().await.get(key).cloned())
    }

    async fn save(&self, key: &ClientKey, tokens: TokenPair) -> Result<u64> {
        let mut clients = self.clients.write().await;
        let version = clients.get(key).map_or(1, |c| c.version + 1);

        clients.insert(
            key.clone(),
            AuthorizedClient {
                key: key.clone(),
                tokens,
                version,
            },
        );

        Ok(version)
    }

    async fn replace(
        &self,
        key: &ClientKey,
        expected_version: u64,
        tokens: TokenPair,
    ) -> Result<u64> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;

        if client.version != expected_version {
            return Err(StoreError::Conflict {
                key: key.clone(),
                expected: expected_version,
                found: client.version,
            });
        }

        client.tokens = tokens;
        client.version += 1;
        Ok(client.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ClientKey {
        ClientKey::new("scalekit", "usr_1")
    }

    #[tokio::test]
    async fn load_missing_is_none() {
        let store = MemoryStore::new();
        assert!(store.load(&key()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_then_load() {
        let store = MemoryStore::new();
        let version = store.save(&key(), TokenPair::bearer("A")).await.unwrap();
        assert_eq!(version, 1);

        let client = store.load(&key()).await.unwrap().unwrap();
        assert_eq!(client.tokens.access_token, "A");
        assert_eq!(client.version, 1);

        let version = store.save(&key(), TokenPair::bearer("B")).await.unwrap();
        assert_eq!(version, 2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn replace_fully_overwrites() {
        let store = MemoryStore::new();
        store
            .save(
                &key(),
                TokenPair::bearer("A")
                    .with_refresh_token("R")
                    .with_scopes(["openid"]),
            )
            .await
            .unwrap();

        let version = store
            .replace(&key(), 1, TokenPair::bearer("B"))
            .await
            .unwrap();
        assert_eq!(version, 2);

        let client = store.load(&key()).await.unwrap().unwrap();
        assert_eq!(client.tokens, TokenPair::bearer("B"));
    }

    #[tokio::test]
    async fn replace_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        store.save(&key(), TokenPair::bearer("A")).await.unwrap();
        store.replace(&key(), 1, TokenPair::bearer("B")).await.unwrap();

        let err = store
            .replace(&key(), 1, TokenPair::bearer("stale"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                found: 2,
                ..
            }
        ));

        let client = store.load(&key()).await.unwrap().unwrap();
        assert_eq!(client.tokens.access_token, "B");
    }

    #[tokio::test]
    async fn replace_missing_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .replace(&key(), 1, TokenPair::bearer("A"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = MemoryStore::new();
        let other = ClientKey::new("scalekit", "usr_2");
        store.save(&key(), TokenPair::bearer("A")).await.unwrap();
        store.save(&other, TokenPair::bearer("Z")).await.unwrap();

        store.replace(&key(), 1, TokenPair::bearer("B")).await.unwrap();

        let untouched = store.load(&other).await.unwrap().unwrap();
        assert_eq!(untouched.tokens.access_token, "Z");
        assert_eq!(untouched.version, 1);
    }
}
