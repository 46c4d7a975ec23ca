//! 局面ごとの対局統計
//!
//! 保存単位は局面単位の集計 `PositionStats`（エクスプローラ応答と同じ形）。
//! 指し手ごとの対局数は `games_for_move` / `top_moves` で引く。

pub mod cache;
pub mod client;
pub mod explorer;

pub use cache::StatsCache;
pub use client::{StatsClient, StatsSource};
pub use explorer::LichessExplorer;

use serde::{Deserialize, Serialize};

use crate::position::Side;

/// 1 手ぶんの集計
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveStats {
    #[serde(default)]
    pub uci: String,
    #[serde(default)]
    pub white: u64,
    #[serde(default)]
    pub draws: u64,
    #[serde(default)]
    pub black: u64,
    #[serde(default, rename = "averageRating")]
    pub average_rating: u32,
}

impl MoveStats {
    pub fn total(&self) -> u64 {
        self.white + self.draws + self.black
    }
}

/// 局面単位の集計。`moves` に無い手は 0 局。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionStats {
    #[serde(default)]
    pub white: u64,
    #[serde(default)]
    pub draws: u64,
    #[serde(default)]
    pub black: u64,
    #[serde(default)]
    pub moves: Vec<MoveStats>,
}

impl PositionStats {
    pub fn total(&self) -> u64 {
        self.white + self.draws + self.black
    }

    pub fn games_for_move(&self, uci: &str) -> u64 {
        self.moves.iter().find(|m| m.uci == uci).map_or(0, MoveStats::total)
    }

    /// 対局数の多い順に最大 `n` 手。同数は UCI 表記順。
    pub fn top_moves(&self, n: usize) -> Vec<&MoveStats> {
        let mut sorted: Vec<&MoveStats> = self.moves.iter().collect();
        sorted.sort_by(|a, b| b.total().cmp(&a.total()).then_with(|| a.uci.cmp(&b.uci)));
        sorted.truncate(n);
        sorted
    }
}

/// 問い合わせ条件。キャッシュの backend キーにそのまま使う。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum StatFilters {
    /// マスター戦データベース
    Masters,
    /// 特定ユーザーの対局履歴
    Player {
        username: String,
        color: Side,
        speeds: String,
    },
}

impl StatFilters {
    pub fn player(username: &str, color: Side, speeds: &str) -> Self {
        StatFilters::Player {
            username: username.to_string(),
            color,
            speeds: speeds.to_string(),
        }
    }

    pub fn backend_key(&self) -> String {
        match self {
            StatFilters::Masters => "lichess_masters".to_string(),
            StatFilters::Player {
                username,
                color,
                speeds,
            } => format!("lichess_player_{}_{}_{}", username.to_lowercase(), color, speeds),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PositionStats {
        serde_json::from_str(
            r#"{"white":10,"draws":5,"black":3,"moves":[
                {"uci":"e2e4","white":6,"draws":2,"black":1,"averageRating":2500},
                {"uci":"d2d4","white":4,"draws":3,"black":2}
            ],"topGames":[]}"#,
        )
        .unwrap()
    }

    #[test]
    fn parses_explorer_payload_and_ignores_extra_fields() {
        let stats = sample();
        assert_eq!(stats.total(), 18);
        assert_eq!(stats.games_for_move("e2e4"), 9);
        assert_eq!(stats.games_for_move("g1f3"), 0);
        assert_eq!(stats.moves[0].average_rating, 2500);
    }

    #[test]
    fn top_moves_breaks_ties_by_uci() {
        let stats = sample();
        let top: Vec<&str> = stats.top_moves(5).iter().map(|m| m.uci.as_str()).collect();
        assert_eq!(top, vec!["d2d4", "e2e4"]);
        assert_eq!(stats.top_moves(1).len(), 1);
    }

    #[test]
    fn backend_keys_encode_all_dimensions() {
        assert_eq!(StatFilters::Masters.backend_key(), "lichess_masters");
        assert_eq!(
            StatFilters::player("Alice", Side::Black, "rapid").backend_key(),
            "lichess_player_alice_black_rapid"
        );
    }
}
