//! 定跡木のビームサーチ
//!
//! - `tree`: ノードのアリーナ
//! - `classify`: 対局数による定跡手 / 候補手の分類
//! - `coordinator`: 手数ごとの展開・評価・枝刈り

pub mod classify;
pub mod coordinator;
pub mod tree;

pub use classify::{MoveClass, Thresholds};
pub use coordinator::{Coordinator, Repertoire, SearchReport, Termination};
pub use tree::{NodeId, SearchNode, SearchTree};

use crate::engine::Score;

/// 調査側視点に直した 1 深さぶんの評価
#[derive(Clone, Debug, PartialEq)]
pub struct DepthScore {
    pub depth: u32,
    pub score: Score,
}

impl DepthScore {
    pub fn cp(&self) -> i32 {
        self.score.to_cp()
    }
}

/// 評価済みの新手
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate {
    /// 根から新手までの手順 (UCI、新手を含む)
    pub moves: Vec<String>,
    /// 新手が根から何手目か (1 始まり)
    pub ply: u32,
    /// 新手直前の局面の総対局数
    pub pre_games: u64,
    /// 新手が指された対局数
    pub post_games: u64,
    pub per_depth: Vec<DepthScore>,
    pub eval_cp: f64,
    pub stability: f64,
    pub rarity: f64,
    pub score: f64,
    /// 新手の後の読み筋 (UCI)
    pub pv: Vec<String>,
}

impl Candidate {
    pub fn novelty(&self) -> &str {
        self.moves.last().map_or("", String::as_str)
    }

    /// 新手より前の手順
    pub fn book_moves(&self) -> &[String] {
        &self.moves[..self.moves.len().saturating_sub(1)]
    }
}
