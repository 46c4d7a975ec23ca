//! 実行設定
//!
//! `RunConfig` は TOML ファイルと CLI の両方から組み立てられる素の値。
//! `validate()` を一度だけ通して `SearchConfig` にしてから探索へ渡す。

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::position::{Position, Side};

/// プレイヤー / 対戦相手の対局履歴インデックスを使う場合の設定。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompanionConfig {
    pub player: Option<String>,
    pub opponent: Option<String>,
    pub player_speeds: String,
    pub opponent_speeds: String,
    /// プレイヤーのレパートリーとみなす最小対局数
    pub min_player_games: u64,
    /// 相手の定番手とみなす最小対局数
    pub min_opponent_games: u64,
    /// true ならキャッシュに無い履歴を explorer へ問い合わせる
    pub live: bool,
}

impl Default for CompanionConfig {
    fn default() -> Self {
        Self {
            player: None,
            opponent: None,
            player_speeds: "blitz,rapid,classical".to_string(),
            opponent_speeds: "blitz,rapid,classical".to_string(),
            min_player_games: 3,
            min_opponent_games: 3,
            live: false,
        }
    }
}

impl CompanionConfig {
    pub fn is_active(&self) -> bool {
        self.player.is_some() || self.opponent.is_some()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunConfig {
    /// FEN / `startpos` / `position ...` 行
    pub root: String,
    pub side: Side,
    pub max_plies: u32,
    pub beam: usize,
    pub depths: Vec<u32>,
    /// 1 深さあたりの思考時間上限
    pub time_budget_ms: u64,
    pub workers: usize,
    pub max_positions: usize,
    pub min_book_games: u64,
    pub novelty_threshold: u64,
    /// true なら対局数 == novelty_threshold も候補に含める
    pub novelty_inclusive: bool,
    pub opponent_responses: usize,
    pub continuations: usize,
    pub min_eval: f64,
    pub output: PathBuf,
    pub companion: CompanionConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            root: "startpos".to_string(),
            side: Side::White,
            max_plies: 16,
            beam: 10,
            depths: vec![20, 24, 28],
            time_budget_ms: 5_000,
            workers: 4,
            max_positions: 800,
            min_book_games: 5,
            novelty_threshold: 2,
            novelty_inclusive: false,
            opponent_responses: 3,
            continuations: 6,
            min_eval: 0.0,
            output: PathBuf::from("ideas.pgn"),
            companion: CompanionConfig::default(),
        }
    }
}

impl RunConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// 矛盾のない設定かを検査し、開始局面を解決する。
    pub fn validate(mut self) -> Result<SearchConfig, ConfigError> {
        ensure_at_least("max_plies", u64::from(self.max_plies), 1)?;
        ensure_at_least("beam", self.beam as u64, 1)?;
        ensure_at_least("workers", self.workers as u64, 1)?;
        ensure_at_least("max_positions", self.max_positions as u64, 1)?;
        ensure_at_least("time_budget_ms", self.time_budget_ms, 1)?;
        ensure_at_least("opponent_responses", self.opponent_responses as u64, 1)?;
        if self.novelty_threshold > self.min_book_games {
            return Err(ConfigError::ContradictoryThresholds {
                novelty_threshold: self.novelty_threshold,
                min_book_games: self.min_book_games,
            });
        }
        if !self.min_eval.is_finite() {
            return Err(ConfigError::NonFiniteMinEval);
        }
        self.depths.retain(|&d| d > 0);
        self.depths.sort_unstable();
        self.depths.dedup();
        if self.depths.is_empty() {
            return Err(ConfigError::EmptyDepths);
        }
        let root = Position::parse(&self.root)?;
        Ok(SearchConfig { root, params: self })
    }
}

fn ensure_at_least(field: &'static str, value: u64, min: u64) -> Result<(), ConfigError> {
    if value < min {
        return Err(ConfigError::OutOfRange { field, min, value });
    }
    Ok(())
}

/// 検証済みの不変な実行設定。`RunConfig::validate` からのみ作られる。
#[derive(Clone, Debug)]
pub struct SearchConfig {
    root: Position,
    params: RunConfig,
}

impl SearchConfig {
    pub fn root(&self) -> &Position {
        &self.root
    }

    pub fn params(&self) -> &RunConfig {
        &self.params
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let cfg = RunConfig::default().validate().unwrap();
        assert!(cfg.root().is_startpos());
        assert_eq!(cfg.params().depths, vec![20, 24, 28]);
    }

    #[test]
    fn contradictory_thresholds_fail_fast() {
        let cfg = RunConfig {
            novelty_threshold: 6,
            min_book_games: 5,
            ..RunConfig::default()
        };
        match cfg.validate() {
            Err(ConfigError::ContradictoryThresholds {
                novelty_threshold: 6,
                min_book_games: 5,
            }) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn equal_thresholds_are_allowed() {
        let cfg = RunConfig {
            novelty_threshold: 5,
            min_book_games: 5,
            ..RunConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn depths_are_sorted_and_deduplicated() {
        let cfg = RunConfig {
            depths: vec![24, 0, 16, 24],
            ..RunConfig::default()
        };
        assert_eq!(cfg.validate().unwrap().params().depths, vec![16, 24]);

        let empty = RunConfig {
            depths: vec![0],
            ..RunConfig::default()
        };
        assert!(matches!(empty.validate(), Err(ConfigError::EmptyDepths)));
    }

    #[test]
    fn zero_beam_and_bad_root_are_rejected() {
        let zero_beam = RunConfig {
            beam: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            zero_beam.validate(),
            Err(ConfigError::OutOfRange { field: "beam", .. })
        ));

        let bad_root = RunConfig {
            root: "8/8/8 w".to_string(),
            ..RunConfig::default()
        };
        assert!(matches!(bad_root.validate(), Err(ConfigError::InvalidPosition(_))));
    }

    #[test]
    fn toml_overrides_defaults() {
        let cfg = RunConfig::from_toml_str(
            r#"
            side = "black"
            beam = 4
            depths = [12, 16]

            [companion]
            player = "alice"
            min_player_games = 1
            live = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.side, Side::Black);
        assert_eq!(cfg.beam, 4);
        assert_eq!(cfg.depths, vec![12, 16]);
        assert_eq!(cfg.max_plies, RunConfig::default().max_plies);
        assert_eq!(cfg.companion.player.as_deref(), Some("alice"));
        assert!(cfg.companion.is_active());
        assert!(cfg.companion.live);

        assert!(RunConfig::from_toml_str("unknown_key = 1").is_err());
    }
}
