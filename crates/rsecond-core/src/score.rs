//! 候補手の総合点
//!
//! `score = eval_cp - 5 * stability + 50 * rarity`
//!
//! - `eval_cp`: 深さごとの評価値 (調査側視点) の平均
//! - `stability`: 同じ値の標本標準偏差。深さが 1 つなら 0
//! - `rarity`: `1 / (1 + ln(1 + 対局数))`

use std::cmp::Ordering;

use crate::search::Candidate;

pub const STABILITY_WEIGHT: f64 = 5.0;
pub const RARITY_WEIGHT: f64 = 50.0;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ScoreBreakdown {
    pub eval_cp: f64,
    pub stability: f64,
    pub rarity: f64,
    pub score: f64,
}

/// (0, 1] の範囲で、対局数に対して狭義単調減少。
pub fn rarity_bonus(prior_count: u64) -> f64 {
    1.0 / (1.0 + (prior_count as f64).ln_1p())
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

pub fn stability(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let var = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    var.sqrt()
}

/// 深さごとの centipawn (調査側視点) から総合点を出す。空なら `None`。
pub fn score_line(per_depth_cp: &[i32], prior_count: u64) -> Option<ScoreBreakdown> {
    if per_depth_cp.is_empty() {
        return None;
    }
    let values: Vec<f64> = per_depth_cp.iter().map(|&cp| f64::from(cp)).collect();
    let eval_cp = mean(&values);
    let stability = stability(&values);
    let rarity = rarity_bonus(prior_count);
    Some(ScoreBreakdown {
        eval_cp,
        stability,
        rarity,
        score: eval_cp - STABILITY_WEIGHT * stability + RARITY_WEIGHT * rarity,
    })
}

/// 順位付けの比較。総合点の降順、対局数の少ない順、浅い順、手順の文字列順。
pub fn compare(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.post_games.cmp(&b.post_games))
        .then_with(|| a.ply.cmp(&b.ply))
        .then_with(|| a.moves.cmp(&b.moves))
}

pub fn rank(candidates: &mut [Candidate]) {
    candidates.sort_by(compare);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(moves: &[&str], score: f64, post_games: u64) -> Candidate {
        Candidate {
            moves: moves.iter().map(|m| m.to_string()).collect(),
            ply: moves.len() as u32,
            pre_games: 100,
            post_games,
            per_depth: Vec::new(),
            eval_cp: score,
            stability: 0.0,
            rarity: rarity_bonus(post_games),
            score,
            pv: Vec::new(),
        }
    }

    #[test]
    fn rarity_is_bounded_and_decreasing() {
        assert_eq!(rarity_bonus(0), 1.0);
        let mut prev = rarity_bonus(0);
        for n in 1..200 {
            let r = rarity_bonus(n);
            assert!(r > 0.0 && r < prev);
            prev = r;
        }
    }

    #[test]
    fn stability_is_sample_deviation() {
        assert_eq!(stability(&[80.0]), 0.0);
        assert_eq!(stability(&[10.0, 10.0, 10.0]), 0.0);
        // 標本分散 = ((−10)^2 + 10^2) / 1
        assert!((stability(&[20.0, 40.0]) - 200f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn composite_score() {
        let b = score_line(&[80, 80, 80], 0).unwrap();
        assert_eq!(b.eval_cp, 80.0);
        assert_eq!(b.stability, 0.0);
        assert_eq!(b.score, 130.0);

        let rare = score_line(&[100], 0).unwrap();
        let common = score_line(&[100], 50).unwrap();
        assert!(rare.score > common.score);
        assert!(score_line(&[], 0).is_none());
    }

    #[test]
    fn ties_prefer_rarer_then_shallower_then_path() {
        let mut cands = vec![
            candidate(&["e2e4", "e7e5", "g1f3"], 50.0, 1),
            candidate(&["d2d4", "d7d5", "c2c4"], 50.0, 0),
            candidate(&["a2a3"], 50.0, 0),
            candidate(&["b2b3"], 50.0, 0),
            candidate(&["h2h4"], 90.0, 1),
        ];
        rank(&mut cands);
        let order: Vec<String> = cands.iter().map(|c| c.moves.join(" ")).collect();
        assert_eq!(
            order,
            vec!["h2h4", "a2a3", "b2b3", "d2d4 d7d5 c2c4", "e2e4 e7e5 g1f3"]
        );
    }
}
