use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::utils::retry::{retry_async_with_config, RetryConfig};

/// Proof of holding the lock on one activity session.
pub struct ActivityLease {
    pub key: String,
    token: String,
    guard: Option<OwnedMutexGuard<()>>,
}

/// Serialises `buildNext` and peer resolution per activity session.
#[async_trait]
pub trait ActivityLock: Send + Sync {
    async fn acquire(&self, activity_session_id: &str) -> Result<ActivityLease>;

    async fn release(&self, lease: ActivityLease) -> Result<()>;

    async fn ping(&self) -> Result<()>;
}

const LOCK_TTL_MS: u64 = 30_000;

// Deletes the key only if it still holds our token.
const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

pub struct RedisActivityLock {
    redis: ConnectionManager,
    retry: RetryConfig,
}

impl RedisActivityLock {
    pub fn new(redis: ConnectionManager) -> Self {
        Self {
            redis,
            retry: RetryConfig::lock_acquisition(),
        }
    }

    fn key(activity_session_id: &str) -> String {
        format!("player:activity-lock:{}", activity_session_id)
    }
}

#[async_trait]
impl ActivityLock for RedisActivityLock {
    async fn acquire(&self, activity_session_id: &str) -> Result<ActivityLease> {
        let key = Self::key(activity_session_id);
        let token = Uuid::new_v4().to_string();

        retry_async_with_config(self.retry.clone(), || {
            let mut conn = self.redis.clone();
            let key = key.clone();
            let token = token.clone();
            async move {
                let acquired: Option<String> = redis::cmd("SET")
                    .arg(&key)
                    .arg(&token)
                    .arg("NX")
                    .arg("PX")
                    .arg(LOCK_TTL_MS)
                    .query_async(&mut conn)
                    .await
                    .context("Failed to acquire activity lock")?;

                match acquired {
                    Some(_) => Ok(()),
                    None => Err(anyhow!("Activity {} is locked", key)),
                }
            }
        })
        .await?;

        tracing::debug!("Acquired activity lock {}", key);
        Ok(ActivityLease {
            key,
            token,
            guard: None,
        })
    }

    async fn release(&self, lease: ActivityLease) -> Result<()> {
        let mut conn = self.redis.clone();
        let released: i32 = redis::Script::new(RELEASE_SCRIPT)
            .key(&lease.key)
            .arg(&lease.token)
            .invoke_async(&mut conn)
            .await
            .context("Failed to release activity lock")?;

        if released == 0 {
            tracing::warn!("Activity lock {} expired before release", lease.key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.redis.clone();
        tokio::time::timeout(
            Duration::from_millis(500),
            redis::cmd("PING").query_async::<String>(&mut conn),
        )
        .await
        .map_err(|_| anyhow!("Redis timeout after 500ms"))?
        .context("Redis ping failed")?;
        Ok(())
    }
}

/// In-process lock for single-instance deployments and tests.
#[derive(Default)]
pub struct LocalActivityLock {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalActivityLock {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ActivityLock for LocalActivityLock {
    async fn acquire(&self, activity_session_id: &str) -> Result<ActivityLease> {
        let slot = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(activity_session_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };

        let guard = slot.lock_owned().await;
        Ok(ActivityLease {
            key: activity_session_id.to_string(),
            token: String::new(),
            guard: Some(guard),
        })
    }

    async fn release(&self, mut lease: ActivityLease) -> Result<()> {
        drop(lease.guard.take());

        let mut locks = self.locks.lock().await;
        if let Some(slot) = locks.get(&lease.key) {
            if Arc::strong_count(slot) == 1 {
                locks.remove(&lease.key);
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
