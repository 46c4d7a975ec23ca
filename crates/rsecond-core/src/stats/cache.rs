//! SQLite による統計キャッシュ
//!
//! 1 接続を Mutex で共有し、実行中に読んだ行はメモリ上にも保持する。
//! 読み込み時の I/O・デコードエラーはミス扱いにしてネットワーク経路へ進ませる。

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};

use super::{PositionStats, StatFilters};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS explorer_cache (
    fen     TEXT    NOT NULL,
    backend TEXT    NOT NULL,
    payload TEXT    NOT NULL,
    ts      INTEGER NOT NULL,
    PRIMARY KEY (fen, backend)
)";

type MemoKey = (String, String);

pub struct StatsCache {
    conn: Mutex<Connection>,
    memo: RwLock<HashMap<MemoKey, PositionStats>>,
}

impl StatsCache {
    /// キャッシュファイルを開く（親ディレクトリは必要なら作る）。
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open cache {}", path.display()))?;
        // WAL は journal_mode の戻り値として行を返すので query_row で受ける
        let _mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute(SCHEMA, []).context("failed to create cache schema")?;
        Ok(Self {
            conn: Mutex::new(conn),
            memo: RwLock::new(HashMap::new()),
        })
    }

    /// キャッシュ済みの集計を返す。読めなければ `None`。
    pub fn get(&self, position_key: &str, filters: &StatFilters) -> Option<PositionStats> {
        let key = (position_key.to_string(), filters.backend_key());
        if let Ok(memo) = self.memo.read() {
            if let Some(hit) = memo.get(&key) {
                return Some(hit.clone());
            }
        }
        match self.read_row(&key.0, &key.1) {
            Ok(Some(stats)) => {
                if let Ok(mut memo) = self.memo.write() {
                    memo.insert(key, stats.clone());
                }
                Some(stats)
            }
            Ok(None) => None,
            Err(e) => {
                log::warn!("cache read failed for {} [{}]: {e:#}", key.0, key.1);
                None
            }
        }
    }

    /// 冪等な upsert。同じ内容の再保存は何もしない。
    pub fn put(&self, position_key: &str, filters: &StatFilters, stats: &PositionStats) -> Result<()> {
        let backend = filters.backend_key();
        let payload = serde_json::to_string(stats)?;
        let ts = SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64);
        {
            let conn = self.conn.lock().map_err(|_| anyhow::anyhow!("cache connection poisoned"))?;
            conn.execute(
                "INSERT INTO explorer_cache (fen, backend, payload, ts)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(fen, backend) DO UPDATE SET
                     payload = excluded.payload,
                     ts      = excluded.ts
                 WHERE explorer_cache.payload <> excluded.payload",
                params![position_key, backend, payload, ts],
            )
            .with_context(|| format!("failed to store {position_key} [{backend}]"))?;
        }
        if let Ok(mut memo) = self.memo.write() {
            memo.insert((position_key.to_string(), backend), stats.clone());
        }
        Ok(())
    }

    /// backend ごとの行数（backend 名順）。
    pub fn backend_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.conn.lock().map_err(|_| anyhow::anyhow!("cache connection poisoned"))?;
        let mut stmt = conn.prepare(
            "SELECT backend, COUNT(*) FROM explorer_cache GROUP BY backend ORDER BY backend",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    fn read_row(&self, fen: &str, backend: &str) -> Result<Option<PositionStats>> {
        let payload: Option<String> = {
            let conn =
                self.conn.lock().map_err(|_| anyhow::anyhow!("cache connection poisoned"))?;
            conn.query_row(
                "SELECT payload FROM explorer_cache WHERE fen = ?1 AND backend = ?2",
                params![fen, backend],
                |row| row.get(0),
            )
            .optional()?
        };
        match payload {
            Some(text) => Ok(Some(
                serde_json::from_str(&text).context("corrupt cache payload")?,
            )),
            None => Ok(None),
        }
    }

    #[cfg(test)]
    fn raw_put(&self, fen: &str, backend: &str, payload: &str) {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO explorer_cache (fen, backend, payload, ts) VALUES (?1, ?2, ?3, 0)",
            params![fen, backend, payload],
        )
        .unwrap();
    }
}
