use std::fmt;

/// 詰みを centipawn に換算するときの値
pub const MATE_CP: i32 = 10_000;

/// 手番側から見た評価値
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Score {
    Cp(i32),
    /// 正なら手番側が n 手で詰ませる。0 以下は詰まされる。
    Mate(i32),
}

impl Score {
    pub fn to_cp(self) -> i32 {
        match self {
            Score::Cp(cp) => cp,
            Score::Mate(n) if n > 0 => MATE_CP,
            // mate 0 は手番側が詰んでいる
            Score::Mate(_) => -MATE_CP,
        }
    }

    /// 反対側の視点に変える。
    pub fn negate(self) -> Self {
        match self {
            Score::Cp(cp) => Score::Cp(-cp),
            Score::Mate(n) => Score::Mate(-n),
        }
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Score::Cp(cp) => write!(f, "cp {cp}"),
            Score::Mate(n) => write!(f, "mate {n}"),
        }
    }
}

#[derive(Default, Clone, Debug)]
pub struct InfoSnapshot {
    pub score: Option<Score>,
    pub pv: Vec<String>,
}

impl InfoSnapshot {
    /// info 行を解析し、multipv=1 の情報を保持する。
    pub fn update_from_line(&mut self, line: &str) {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        if tokens.first().copied() != Some("info") {
            return;
        }
        let multipv = tokens
            .windows(2)
            .find(|w| w[0] == "multipv")
            .and_then(|w| w[1].parse::<u32>().ok())
            .unwrap_or(1);
        if multipv != 1 {
            return;
        }
        let mut i = 1;
        while i < tokens.len() {
            let next = tokens.get(i + 1).copied();
            match tokens[i] {
                // 評価値と読み筋以外 (depth, nodes など) は読み飛ばす
                "score" => {
                    let value = tokens.get(i + 2).and_then(|t| t.parse::<i32>().ok());
                    match (next, value) {
                        (Some("cp"), Some(v)) => self.score = Some(Score::Cp(v)),
                        (Some("mate"), Some(v)) => self.score = Some(Score::Mate(v)),
                        _ => {}
                    }
                    i += 2;
                }
                "pv" => {
                    let pv: Vec<String> = tokens[i + 1..].iter().map(|t| t.to_string()).collect();
                    if !pv.is_empty() {
                        self.pv = pv;
                    }
                    break;
                }
                // 文字列は行末まで続くので以降は読まない
                "string" => break,
                _ => {}
            }
            i += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_snapshot_parses_primary_pv() {
        let mut snap = InfoSnapshot::default();
        snap.update_from_line(
            "info depth 10 seldepth 12 multipv 1 score cp 34 nodes 12345 nps 890 time 67 pv e2e4 e7e5",
        );
        assert_eq!(snap.score, Some(Score::Cp(34)));
        assert_eq!(snap.pv, vec!["e2e4".to_string(), "e7e5".to_string()]);

        // multipv != 1 は無視される
        snap.update_from_line("info depth 20 multipv 2 score cp 100 pv d2d4");
        assert_eq!(snap.score, Some(Score::Cp(34)));
        assert_eq!(snap.pv[0], "e2e4");
    }

    #[test]
    fn bound_and_mate_scores() {
        let mut snap = InfoSnapshot::default();
        snap.update_from_line("info depth 5 score cp 12 lowerbound pv g1f3");
        assert_eq!(snap.score, Some(Score::Cp(12)));
        snap.update_from_line("info depth 6 score mate -3 pv g1f3");
        assert_eq!(snap.score, Some(Score::Mate(-3)));
        assert_eq!(snap.score.unwrap().to_cp(), -MATE_CP);

        snap.update_from_line("info string NNUE evaluation using nn.nnue score cp 99 pv a2a3");
        assert_eq!(snap.score, Some(Score::Mate(-3)));
        assert_eq!(snap.pv, vec!["g1f3".to_string()]);
    }

    #[test]
    fn negate_flips_perspective() {
        assert_eq!(Score::Cp(-80).negate(), Score::Cp(80));
        assert_eq!(Score::Mate(2).negate().to_cp(), -MATE_CP);
    }
}
