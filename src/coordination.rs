//! Coordination store: atomic set-if-absent-with-expiry plus a
//! compare-and-set script for renewal/release. Implemented against `redis`,
//! the same coordination-store crate used elsewhere for exactly this kind
//! of shared, TTL'd state.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::Script;

use crate::error::StoreError;

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// `SET key value NX PX ttl_ms`. Returns `true` if the key was set.
    async fn set_nx(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Overwrites `key` with `new_value` (preserving TTL semantics by
    /// re-applying `ttl_ms`) only if the JSON stored under `key` has a
    /// `node_id` field equal to `expected_node_id`. Returns `true` on success.
    async fn cas_renew(
        &self,
        key: &str,
        expected_node_id: &str,
        new_value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError>;

    /// Deletes `key` only if its JSON `node_id` equals `expected_node_id`.
    async fn cas_delete(&self, key: &str, expected_node_id: &str) -> Result<bool, StoreError>;
}

pub struct RedisCoordinationStore {
    client: redis::Client,
}

impl RedisCoordinationStore {
    pub fn new(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(StoreError::Coordination)?;
        Ok(Self { client })
    }
}

const CAS_RENEW_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  return 0
end
local ok, decoded = pcall(cjson.decode, current)
if not ok or decoded.node_id ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
return 1
"#;

const CAS_DELETE_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if current == false then
  return 0
end
local ok, decoded = pcall(cjson.decode, current)
if not ok or decoded.node_id ~= ARGV[1] then
  return 0
end
redis.call('DEL', KEYS[1])
return 1
"#;

#[async_trait]
impl CoordinationStore for RedisCoordinationStore {
    async fn set_nx(&self, key: &str, value: &str, ttl_ms: u64) -> Result<bool, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: redis::RedisResult<Option<String>> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await;
        Ok(result?.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn cas_renew(
        &self,
        key: &str,
        expected_node_id: &str,
        new_value: &str,
        ttl_ms: u64,
    ) -> Result<bool, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: i64 = Script::new(CAS_RENEW_SCRIPT)
            .key(key)
            .arg(expected_node_id)
            .arg(new_value)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }

    async fn cas_delete(&self, key: &str, expected_node_id: &str) -> Result<bool, StoreError> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let result: i64 = Script::new(CAS_DELETE_SCRIPT)
            .key(key)
            .arg(expected_node_id)
            .invoke_async(&mut conn)
            .await?;
        Ok(result == 1)
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeCoordinationStore {
        entries: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl CoordinationStore for FakeCoordinationStore {
        async fn set_nx(&self, key: &str, value: &str, _ttl_ms: u64) -> Result<bool, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            if entries.contains_key(key) {
                Ok(false)
            } else {
                entries.insert(key.to_string(), value.to_string());
                Ok(true)
            }
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn cas_renew(
            &self,
            key: &str,
            expected_node_id: &str,
            new_value: &str,
            _ttl_ms: u64,
        ) -> Result<bool, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some(current) if current_node_id(current) == expected_node_id => {
                    entries.insert(key.to_string(), new_value.to_string());
                    Ok(true)
                }
                _ => Ok(false),
            }
        }

        async fn cas_delete(&self, key: &str, expected_node_id: &str) -> Result<bool, StoreError> {
            let mut entries = self.entries.lock().unwrap();
            match entries.get(key) {
                Some(current) if current_node_id(current) == expected_node_id => {
                    entries.remove(key);
                    Ok(true)
                }
                _ => Ok(false),
            }
        }
    }

    impl FakeCoordinationStore {
        /// Simulates an external process deleting the lock key out from under
        /// the holder — used to exercise failover when a node loses the lock
        /// without releasing it cleanly.
        pub fn delete_unconditionally(&self, key: &str) {
            self.entries.lock().unwrap().remove(key);
        }
    }

    fn current_node_id(raw: &str) -> String {
        serde_json::from_str::<crate::models::LeaderLockValue>(raw)
            .map(|v| v.node_id)
            .unwrap_or_default()
    }
}
