use async_trait::async_trait;
use std::time::Duration;
use uuid::Uuid;

/// Per-service distributed mutual exclusion (spec §4.2). Acquire is non-blocking; Release must
/// be a compare-and-delete against the held token so a thief can never drop another owner's lock.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    async fn acquire(&self, key: &str, ttl: Duration) -> eyre::Result<Option<LockGuard>>;
    async fn release(&self, key: &str, token: &str) -> eyre::Result<bool>;
    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> eyre::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct LockGuard {
    pub key: String,
    pub token: String,
}

/// Lua compare-and-delete: only remove the key if the stored value still matches our token.
/// This is the same discipline as a non-blocking advisory-lock probe-then-release, re-expressed
/// as a SETNX+TTL backend instead of Postgres advisory locks.
const RELEASE_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end
"#;

const EXTEND_SCRIPT: &str = r#"
if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("expire", KEYS[1], ARGV[2])
else
    return 0
end
"#;

pub struct RedisLock {
    manager: redis::aio::ConnectionManager,
}

impl RedisLock {
    pub async fn connect(redis_url: &str) -> eyre::Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn acquire(&self, key: &str, ttl: Duration) -> eyre::Result<Option<LockGuard>> {
        let token = Uuid::new_v4().to_string();
        let mut conn = self.manager.clone();
        let result: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(&token)
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await?;

        Ok(result.map(|_| LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, key: &str, token: &str) -> eyre::Result<bool> {
        let mut conn = self.manager.clone();
        let deleted: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn extend(&self, key: &str, token: &str, ttl: Duration) -> eyre::Result<bool> {
        let mut conn = self.manager.clone();
        let extended: i64 = redis::Script::new(EXTEND_SCRIPT)
            .key(key)
            .arg(token)
            .arg(ttl.as_secs().max(1))
            .invoke_async(&mut conn)
            .await?;
        Ok(extended == 1)
    }
}

/// In-memory lock for tests: a single-process stand-in for the Redis backend that preserves the
/// same compare-and-delete semantics.
#[derive(Default)]
pub struct InMemoryLock {
    inner: tokio::sync::Mutex<std::collections::HashMap<String, String>>,
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn acquire(&self, key: &str, _ttl: Duration) -> eyre::Result<Option<LockGuard>> {
        let mut guard = self.inner.lock().await;
        if guard.contains_key(key) {
            return Ok(None);
        }
        let token = Uuid::new_v4().to_string();
        guard.insert(key.to_string(), token.clone());
        Ok(Some(LockGuard {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, key: &str, token: &str) -> eyre::Result<bool> {
        let mut guard = self.inner.lock().await;
        if guard.get(key).map(|t| t.as_str()) == Some(token) {
            guard.remove(key);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn extend(&self, key: &str, token: &str, _ttl: Duration) -> eyre::Result<bool> {
        let guard = self.inner.lock().await;
        Ok(guard.get(key).map(|t| t.as_str()) == Some(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_denied_while_held() {
        let lock = InMemoryLock::default();
        let first = lock.acquire("recharge_gps", Duration::from_secs(60)).await.unwrap();
        assert!(first.is_some());
        let second = lock.acquire("recharge_gps", Duration::from_secs(60)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn release_requires_matching_token() {
        let lock = InMemoryLock::default();
        let guard = lock.acquire("recharge_voz", Duration::from_secs(60)).await.unwrap().unwrap();
        let stolen = lock.release("recharge_voz", "not-the-real-token").await.unwrap();
        assert!(!stolen);
        let released = lock.release("recharge_voz", &guard.token).await.unwrap();
        assert!(released);
        let reacquired = lock.acquire("recharge_voz", Duration::from_secs(60)).await.unwrap();
        assert!(reacquired.is_some());
    }
}
