//! 対局数による指し手の分類

use crate::position::Position;
use crate::stats::PositionStats;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveClass {
    /// 十分に指されている。評価せずに木を進める。
    Book,
    /// ほとんど指されていない。評価対象。
    Candidate,
    /// どちらでもない
    Neither,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Thresholds {
    pub min_book_games: u64,
    pub novelty_threshold: u64,
    /// true なら count == novelty_threshold も候補
    pub inclusive: bool,
}

impl Thresholds {
    /// 候補判定を先に行うので、両方の境界に乗る対局数は候補になる。
    pub fn classify(&self, count: u64) -> MoveClass {
        let candidate = if self.inclusive {
            count <= self.novelty_threshold
        } else {
            count < self.novelty_threshold
        };
        if candidate {
            MoveClass::Candidate
        } else if count >= self.min_book_games {
            MoveClass::Book
        } else {
            MoveClass::Neither
        }
    }

    /// 局面自体が定跡内か
    pub fn in_book(&self, stats: &PositionStats) -> bool {
        stats.total() >= self.min_book_games
    }
}

/// (UCI, 対局数)
pub type CountedMove = (String, u64);

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Classified {
    pub book: Vec<CountedMove>,
    pub candidates: Vec<CountedMove>,
}

/// 合法手すべてを分類する。順序は UCI 表記順。
pub fn classify_moves(position: &Position, stats: &PositionStats, t: &Thresholds) -> Classified {
    let mut out = Classified::default();
    for uci in position.legal_moves_uci() {
        let count = stats.games_for_move(&uci);
        match t.classify(count) {
            MoveClass::Book => out.book.push((uci, count)),
            MoveClass::Candidate => out.candidates.push((uci, count)),
            MoveClass::Neither => {}
        }
    }
    out
}

/// 対局数の多い順に、合法かつ `min_games` 以上の手を最大 `limit` 手。
pub fn popular_replies(
    position: &Position,
    stats: &PositionStats,
    min_games: u64,
    limit: usize,
) -> Vec<CountedMove> {
    stats
        .top_moves(stats.moves.len())
        .into_iter()
        .filter(|m| m.total() >= min_games && position.is_legal_uci(&m.uci))
        .take(limit)
        .map(|m| (m.uci.clone(), m.total()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MoveStats;

    fn strict(min_book_games: u64, novelty_threshold: u64) -> Thresholds {
        Thresholds {
            min_book_games,
            novelty_threshold,
            inclusive: false,
        }
    }

    fn row(uci: &str, games: u64) -> MoveStats {
        MoveStats {
            uci: uci.to_string(),
            white: games,
            ..MoveStats::default()
        }
    }

    #[test]
    fn book_boundary_is_inclusive() {
        let t = strict(5, 2);
        assert_eq!(t.classify(5), MoveClass::Book);
        assert_eq!(t.classify(4), MoveClass::Neither);
        assert_eq!(t.classify(2), MoveClass::Neither);
        assert_eq!(t.classify(1), MoveClass::Candidate);
        assert_eq!(t.classify(0), MoveClass::Candidate);
    }

    #[test]
    fn inclusive_novelty_boundary() {
        let t = Thresholds {
            inclusive: true,
            ..strict(5, 2)
        };
        assert_eq!(t.classify(2), MoveClass::Candidate);
        assert_eq!(t.classify(3), MoveClass::Neither);
    }

    #[test]
    fn overlapping_boundaries_favor_candidate() {
        let t = Thresholds {
            inclusive: true,
            ..strict(3, 3)
        };
        assert_eq!(t.classify(3), MoveClass::Candidate);
        assert_eq!(strict(3, 3).classify(3), MoveClass::Book);
    }

    #[test]
    fn classify_covers_every_legal_move() {
        let stats = PositionStats {
            white: 60,
            moves: vec![row("e2e4", 50), row("d2d4", 10)],
            ..PositionStats::default()
        };
        let out = classify_moves(&Position::startpos(), &stats, &strict(10, 1));
        assert_eq!(out.book, vec![("d2d4".to_string(), 10), ("e2e4".to_string(), 50)]);
        assert_eq!(out.candidates.len(), 18);
        assert!(out.candidates.iter().all(|(_, c)| *c == 0));
    }

    #[test]
    fn popular_replies_skip_illegal_and_rare_moves() {
        let pos = Position::parse("position startpos moves e2e4").unwrap();
        let stats = PositionStats {
            moves: vec![row("c7c5", 30), row("e7e5", 30), row("e2e4", 99), row("g8f6", 2)],
            ..PositionStats::default()
        };
        let replies = popular_replies(&pos, &stats, 5, 3);
        assert_eq!(replies, vec![("c7c5".to_string(), 30), ("e7e5".to_string(), 30)]);
        assert_eq!(popular_replies(&pos, &stats, 5, 1).len(), 1);
    }
}
