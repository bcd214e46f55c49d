//! 实体级内存锁：串行化同一组 / 专辑 / 曲目上的写操作。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;
use tracing::debug;

use crate::catalog::Entity;
use crate::error::ApiError;

/// Async mutexes keyed by entity directory, plus the wait budget.
#[derive(Debug)]
pub struct EntityLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    wait: Duration,
}

impl EntityLocks {
    pub fn new(wait: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            wait,
        }
    }

    /// 在等待时限内获取实体锁，超时返回 409。
    pub async fn lock(&self, entity: &Entity) -> Result<OwnedMutexGuard<()>, ApiError> {
        let key = entity.lock_key();
        let lock = {
            let mut locks = self.locks.lock().await;
            // Entries nobody holds or waits on can go.
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        match time::timeout(self.wait, lock.lock_owned()).await {
            Ok(guard) => Ok(guard),
            Err(_) => {
                debug!(entity = %key, "entity lock wait timed out");
                Err(ApiError::Conflict(format!("{} is busy", entity.kind())))
            }
        }
    }

    #[cfg(test)]
    async fn tracked(&self) -> usize {
        self.locks.lock().await.len()
    }
}
