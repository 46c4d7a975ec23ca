use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shakmaty::fen::Fen;
use shakmaty::san::San;
use shakmaty::uci::UciMove;
use shakmaty::{CastlingMode, Chess, Color, EnPassantMode, Position as _};

use crate::error::ConfigError;

pub const STARTING_FEN: &str = "rnbqkbnr/pppppppp/8/8/8/8/PPPPPPPP/RNBQKBNR w KQkq - 0 1";

/// 調査する手番。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    White,
    Black,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::White => Side::Black,
            Side::Black => Side::White,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Side::White => "white",
            Side::Black => "black",
        }
    }

    fn from_color(color: Color) -> Self {
        match color {
            Color::White => Side::White,
            Color::Black => Side::Black,
        }
    }
}

impl FromStr for Side {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "white" | "w" => Ok(Side::White),
            "black" | "b" => Ok(Side::Black),
            _ => Err(ConfigError::InvalidSide(s.to_string())),
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// 不変な局面値。合法手生成と表記変換は shakmaty に委ねる。
#[derive(Clone, Debug)]
pub struct Position {
    chess: Chess,
}

impl Default for Position {
    fn default() -> Self {
        Self::startpos()
    }
}

impl Position {
    pub fn startpos() -> Self {
        Self {
            chess: Chess::default(),
        }
    }

    pub fn from_fen(fen: &str) -> Result<Self, ConfigError> {
        let parsed: Fen = fen
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidPosition(format!("{fen}: {e}")))?;
        let chess: Chess = parsed
            .into_position(CastlingMode::Standard)
            .map_err(|e| ConfigError::InvalidPosition(format!("{fen}: {e}")))?;
        Ok(Self { chess })
    }

    /// 生の FEN、`startpos`、または UCI の `position ...` 行を受け付ける。
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let trimmed = text.trim();
        let body = trimmed.strip_prefix("position").map(str::trim_start).unwrap_or(trimmed);
        let (base, moves) = match body.split_once(" moves ") {
            Some((base, moves)) => (base.trim(), moves.split_whitespace().collect::<Vec<_>>()),
            None => (body.strip_suffix(" moves").unwrap_or(body).trim(), Vec::new()),
        };
        let mut pos = if base == "startpos" || base.is_empty() {
            Self::startpos()
        } else {
            Self::from_fen(base.strip_prefix("fen ").unwrap_or(base))?
        };
        for mv in moves {
            pos = pos.play_uci(mv).map_err(|e| ConfigError::InvalidPosition(e.to_string()))?;
        }
        Ok(pos)
    }

    pub fn fen(&self) -> String {
        Fen::from_position(self.chess.clone(), EnPassantMode::Legal).to_string()
    }

    /// 手数カウンタを除いた FEN 先頭 4 フィールド。キャッシュキーと合流判定に使う。
    pub fn key(&self) -> String {
        let fen = self.fen();
        fen.split_whitespace().take(4).collect::<Vec<_>>().join(" ")
    }

    pub fn is_startpos(&self) -> bool {
        self.key() == Self::startpos().key()
    }

    pub fn turn(&self) -> Side {
        Side::from_color(self.chess.turn())
    }

    pub fn fullmove_number(&self) -> u32 {
        self.chess.fullmoves().get()
    }

    pub fn is_game_over(&self) -> bool {
        self.chess.is_game_over()
    }

    /// 合法手を UCI 表記で辞書順に返す。
    pub fn legal_moves_uci(&self) -> Vec<String> {
        let mut moves: Vec<String> = self
            .chess
            .legal_moves()
            .iter()
            .map(|m| m.to_uci(CastlingMode::Standard).to_string())
            .collect();
        moves.sort();
        moves
    }

    pub fn is_legal_uci(&self, uci: &str) -> bool {
        self.parse_move(uci).is_ok()
    }

    pub fn play_uci(&self, uci: &str) -> Result<Position, IllegalMove> {
        let m = self.parse_move(uci)?;
        let mut next = self.chess.clone();
        next.play_unchecked(&m);
        Ok(Position { chess: next })
    }

    /// UCI 表記の手を SAN (チェック記号付き) に変換する。
    pub fn san(&self, uci: &str) -> Result<String, IllegalMove> {
        let m = self.parse_move(uci)?;
        let mut san = San::from_move(&self.chess, &m).to_string();
        let mut after = self.chess.clone();
        after.play_unchecked(&m);
        if after.is_checkmate() {
            san.push('#');
        } else if after.is_check() {
            san.push('+');
        }
        Ok(san)
    }

    fn parse_move(&self, uci: &str) -> Result<shakmaty::Move, IllegalMove> {
        let parsed: UciMove = uci.parse().map_err(|_| IllegalMove(uci.to_string()))?;
        parsed.to_move(&self.chess).map_err(|_| IllegalMove(uci.to_string()))
    }
}

impl PartialEq for Position {
    fn eq(&self, other: &Self) -> bool {
        self.fen() == other.fen()
    }
}

impl Eq for Position {}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("illegal or malformed move '{0}'")]
pub struct IllegalMove(pub String);
