//! 再試行ポリシー
//!
//! 統計クライアントの再取得とエンジンスロットの再起動で共通に使う。
//! 遅延は `base_delay * 2^(attempt-1)` を `max_delay` で頭打ちにし、
//! `jitter` の割合だけ一様乱数で上乗せする。

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use rand::Rng;

use crate::error::{EngineError, FetchError};

/// 再試行で回復し得るエラーかどうか。
pub trait Retryable {
    fn is_transient(&self) -> bool;
}

impl Retryable for FetchError {
    fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transient(_))
    }
}

impl Retryable for EngineError {
    fn is_transient(&self) -> bool {
        // スロット停止と最終失敗以外は再起動で直る可能性がある
        !matches!(self, EngineError::Unavailable { .. } | EngineError::Failed { .. })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// 初回を含む試行回数の上限
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 0.0..=1.0
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(8),
            jitter: 0.25,
        }
    }
}

impl RetryPolicy {
    /// 待ち時間なしのポリシー（テスト・ローカル専用ソース向け）
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
        }
    }

    /// `attempt` 回目 (1 始まり) の失敗後に待つ時間。
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let backoff = self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay);
        if self.jitter <= 0.0 || backoff.is_zero() {
            return backoff;
        }
        let extra = backoff.mul_f64(self.jitter.min(1.0) * rand::rng().random::<f64>());
        backoff + extra
    }

    /// `op` を最大 `max_attempts` 回実行する。
    ///
    /// 恒久的なエラーは即座に返す。一時的なエラーは遅延を挟んで再試行し、
    /// 上限に達したら最後のエラーを返す。`op` には試行番号 (1 始まり) が渡る。
    pub fn run<T, E, F>(&self, label: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() || attempt >= max_attempts => return Err(e),
                Err(e) => {
                    let delay = self.delay_for(attempt);
                    log::warn!(
                        "{label}: {e}, retry {attempt}/{} after {}ms",
                        max_attempts - 1,
                        delay.as_millis()
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
