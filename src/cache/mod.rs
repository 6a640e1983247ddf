//! 进程内实体缓存，带固定过期时间，访问时惰性淘汰

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::routes::card::model::Card;
use crate::routes::user::model::UserProfile;

/// id -> (实体, 写入时间) 的内存缓存。
/// 所有访问经过互斥锁串行化，超过TTL的条目在下次读取时删除。
/// 不设容量上限也不做LRU淘汰，依赖较短的TTL控制增长。
pub struct TtlCache<T> {
    ttl: Duration,
    entries: Mutex<HashMap<String, (T, Instant)>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// 写入条目并记录当前时间，覆盖同id的旧条目
    pub async fn put(&self, id: impl Into<String>, value: T) {
        let mut entries = self.entries.lock().await;
        entries.insert(id.into(), (value, Instant::now()));
    }

    /// 仅当条目未过期时返回，过期条目当场删除
    pub async fn get(&self, id: &str) -> Option<T> {
        self.get_with_now(id, Instant::now()).await
    }

    async fn get_with_now(&self, id: &str, now: Instant) -> Option<T> {
        let mut entries = self.entries.lock().await;
        match entries.get(id) {
            Some((value, fetched_at)) if now.duration_since(*fetched_at) < self.ttl => {
                Some(value.clone())
            }
            Some(_) => {
                entries.remove(id);
                None
            }
            None => None,
        }
    }

    /// 写路径完成后主动失效对应条目
    pub async fn remove(&self, id: &str) {
        let mut entries = self.entries.lock().await;
        entries.remove(id);
    }

    pub async fn clear(&self) {
        let mut entries = self.entries.lock().await;
        entries.clear();
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// 用户与名片两类查询共用的缓存实例，在启动时构造并注入 AppState
pub struct EntityCache {
    pub users: TtlCache<UserProfile>,
    pub cards: TtlCache<Card>,
}

impl EntityCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            users: TtlCache::new(ttl),
            cards: TtlCache::new(ttl),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test]
    async fn put_then_get_returns_value() {
        let cache = TtlCache::new(TTL);
        cache.put("u1", 42u32).await;
        assert_eq!(cache.get("u1").await, Some(42));
    }

    #[tokio::test]
    async fn get_misses_on_unknown_id() {
        let cache: TtlCache<u32> = TtlCache::new(TTL);
        assert_eq!(cache.get("nope").await, None);
    }

    #[tokio::test]
    async fn expired_entry_is_absent_and_evicted() {
        let cache = TtlCache::new(TTL);
        cache.put("u1", 42u32).await;

        let later = Instant::now() + TTL;
        assert_eq!(cache.get_with_now("u1", later).await, None);
        // 惰性淘汰：过期读取后条目已被删除
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn entry_survives_just_under_ttl() {
        let cache = TtlCache::new(TTL);
        cache.put("u1", 7u32).await;

        let almost = Instant::now() + TTL - Duration::from_secs(1);
        assert_eq!(cache.get_with_now("u1", almost).await, Some(7));
    }

    #[tokio::test]
    async fn put_overwrites_existing_entry() {
        let cache = TtlCache::new(TTL);
        cache.put("u1", 1u32).await;
        cache.put("u1", 2u32).await;
        assert_eq!(cache.get("u1").await, Some(2));
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn remove_and_clear_drop_entries() {
        let cache = TtlCache::new(TTL);
        cache.put("u1", 1u32).await;
        cache.put("u2", 2u32).await;

        cache.remove("u1").await;
        assert_eq!(cache.get("u1").await, None);
        assert_eq!(cache.get("u2").await, Some(2));

        cache.clear().await;
        assert!(cache.is_empty().await);
    }
}
