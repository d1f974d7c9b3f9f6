//! 按 (user, role) 串行的进程内锁
//!
//! 锁表只保存正在被持有或等待的条目，最后一个持有者释放时条目随之移除。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::core::{RoleId, UserId};

type Pair = (UserId, RoleId);

#[derive(Default)]
pub struct PairLocks {
    locks: Mutex<HashMap<Pair, Arc<AsyncMutex<()>>>>,
}

/// 持有期间同一 pair 的其他调用方等待
pub struct PairGuard<'a> {
    owner: &'a PairLocks,
    pair: Pair,
    guard: Option<OwnedMutexGuard<()>>,
}

impl PairLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, pair: Pair) -> PairGuard<'_> {
        let slot = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(pair).or_default())
        };
        PairGuard {
            owner: self,
            pair,
            guard: Some(slot.lock_owned().await),
        }
    }

    /// 当前锁表中的条目数
    pub fn tracked(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for PairGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.owner.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // 只剩锁表自己引用时没有人在持有或等待
        if locks
            .get(&self.pair)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            locks.remove(&self.pair);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_entry_removed_after_last_guard() {
        let locks = PairLocks::new();
        {
            let _a = locks.lock((1, 1)).await;
            let _b = locks.lock((2, 1)).await;
            assert_eq!(locks.tracked(), 2);
        }
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_pair_is_serialized() {
        let locks = Arc::new(PairLocks::new());
        let first = locks.lock((1, 1)).await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _g = locks.lock((1, 1)).await;
                tokio::time::Instant::now()
            })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        // 等待者仍挂着，条目不能被移除
        assert_eq!(locks.tracked(), 1);
        let released_at = tokio::time::Instant::now();
        drop(first);
        assert_eq!(locks.tracked(), 1);

        let acquired_at = waiter.await.unwrap();
        assert!(acquired_at >= released_at);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn test_other_pairs_do_not_wait() {
        let locks = PairLocks::new();
        let _a = locks.lock((1, 1)).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.lock((1, 2))).await;
        assert!(b.is_ok());
    }
}
