//! 評価エンジン
//!
//! - `process`: UCI エンジン 1 プロセスの入出力
//! - `pool`: 固定数のスロットとワーカースレッド
//! - `info`: `info` 行の解析
//!
//! スコアはすべて手番側視点で返す。調査側視点への変換は探索側で行う。

pub mod info;
pub mod pool;
pub mod process;

pub use info::{InfoSnapshot, Score, MATE_CP};
pub use pool::{EnginePool, EvalRequest, SlotState};
pub use process::{find_engine, EngineConfig, UciEngine, UciEngineFactory};

use crate::error::EngineError;

/// 1 深さぶんの結果
#[derive(Clone, Debug, PartialEq)]
pub struct DepthEval {
    pub depth: u32,
    pub score: Score,
    pub pv: Vec<String>,
}

/// 1 局面の評価。`per_depth` は要求した深さの昇順。
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Evaluation {
    pub per_depth: Vec<DepthEval>,
}

impl Evaluation {
    /// 最も深い探索の読み筋
    pub fn principal_variation(&self) -> &[String] {
        self.per_depth.last().map_or(&[], |d| d.pv.as_slice())
    }
}

/// 局面を評価できるもの。プール内の 1 スロットが 1 つを占有する。
pub trait Evaluator: Send {
    fn evaluate(
        &mut self,
        fen: &str,
        depths: &[u32],
        time_budget_ms: u64,
    ) -> Result<Evaluation, EngineError>;
}

/// スロットの起動・再起動に使う。
pub trait EngineFactory: Send + Sync {
    fn spawn(&self, slot: usize) -> Result<Box<dyn Evaluator>, EngineError>;
}
