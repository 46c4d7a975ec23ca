//! キャッシュ優先の統計取得
//!
//! キャッシュに無い局面だけをリモートへ問い合わせ、結果を書き戻す。
//! 同じキーへの同時問い合わせはキー単位のロックで 1 回にまとめる。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::FetchError;
use crate::position::Position;
use crate::retry::RetryPolicy;

use super::{PositionStats, StatFilters, StatsCache};

/// リモートの統計ソース
pub trait StatsSource: Send + Sync {
    fn fetch(&self, fen: &str, filters: &StatFilters) -> Result<PositionStats, FetchError>;
}

/// 同じソース (とそのリクエスト間隔) を複数のクライアントで共有する。
impl<T: StatsSource + ?Sized> StatsSource for Arc<T> {
    fn fetch(&self, fen: &str, filters: &StatFilters) -> Result<PositionStats, FetchError> {
        (**self).fetch(fen, filters)
    }
}

pub struct StatsClient {
    cache: Arc<StatsCache>,
    source: Option<Box<dyn StatsSource>>,
    retry: RetryPolicy,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StatsClient {
    pub fn new(cache: Arc<StatsCache>, source: Box<dyn StatsSource>, retry: RetryPolicy) -> Self {
        Self {
            cache,
            source: Some(source),
            retry,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// キャッシュだけを読むクライアント。ミスは常に「データなし」。
    pub fn local_only(cache: Arc<StatsCache>) -> Self {
        Self {
            cache,
            source: None,
            retry: RetryPolicy::immediate(1),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &Arc<StatsCache> {
        &self.cache
    }

    /// 局面の集計を返す。再試行を使い切った場合は `None` (ライン破棄)。
    pub fn lookup(&self, position: &Position, filters: &StatFilters) -> Option<PositionStats> {
        let key = position.key();
        if let Some(hit) = self.cache.get(&key, filters) {
            return Some(hit);
        }
        let source = self.source.as_ref()?;

        let lock_key = format!("{key}|{}", filters.backend_key());
        let lock = self.key_lock(&lock_key);
        let _held = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        // 待っている間に別スレッドが書き込んでいれば、それを使う
        if let Some(hit) = self.cache.get(&key, filters) {
            return Some(hit);
        }

        let fen = position.fen();
        let label = format!("stats {} [{}]", key, filters.backend_key());
        let fetched = match self.retry.run(&label, |_| source.fetch(&fen, filters)) {
            Ok(stats) => {
                if let Err(e) = self.cache.put(&key, filters, &stats) {
                    log::warn!("{label}: cache write failed: {e:#}");
                }
                Some(stats)
            }
            Err(e) => {
                log::warn!("{label}: giving up: {e}");
                None
            }
        };
        // 待機中のスレッドは自分の Arc を持っているので、表からは外してよい
        self.key_locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&lock_key);
        fetched
    }

    fn key_lock(&self, lock_key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(lock_key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}
