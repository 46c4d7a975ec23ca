//! 注釈付き PGN の書き出し
//!
//! 候補 1 件につき 1 局。定跡手は注釈なし、新手に `$146` と評価コメント、
//! その後にエンジンの読み筋を続ける。評価値は PGN の慣習に合わせて白視点。

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;

use crate::engine::Score;
use crate::io::open_writer;
use crate::position::{IllegalMove, Position, Side};
use crate::score;
use crate::search::{Candidate, DepthScore};

/// ChessBase の「新手」NAG
pub const NAG_NOVELTY: u8 = 146;
pub const NAG_GOOD: u8 = 1;
pub const NAG_BRILLIANT: u8 = 3;

const GOOD_CP: f64 = 25.0;
const BRILLIANT_CP: f64 = 75.0;
const LINE_WIDTH: usize = 80;

#[derive(Clone, Debug)]
pub struct ExportContext {
    pub date: NaiveDate,
    /// 調査側
    pub side: Side,
    pub player: Option<String>,
    pub opponent: Option<String>,
}

impl ExportContext {
    pub fn new(date: NaiveDate, side: Side) -> Self {
        Self {
            date,
            side,
            player: None,
            opponent: None,
        }
    }

    fn headers_for_players(&self) -> (String, String) {
        let player = self.player.clone().unwrap_or_else(|| "?".to_string());
        let opponent = self.opponent.clone().unwrap_or_else(|| "?".to_string());
        match self.side {
            Side::White => (player, opponent),
            Side::Black => (opponent, player),
        }
    }
}

/// 調査側視点の値を白視点へ
fn white_relative(score: Score, side: Side) -> Score {
    match side {
        Side::White => score,
        Side::Black => score.negate(),
    }
}

fn format_depth_value(score: Score) -> String {
    match score {
        Score::Cp(cp) => format!("{:+.2}", f64::from(cp) / 100.0),
        Score::Mate(n) if n > 0 => format!("M+{n}"),
        Score::Mate(n) => format!("M-{}", n.unsigned_abs()),
    }
}

/// `[%eval]` には深さ平均を白視点の pawn 単位で入れる。
pub fn eval_annotation(eval_cp: f64, side: Side) -> String {
    let white_cp = match side {
        Side::White => eval_cp,
        Side::Black => -eval_cp,
    };
    format!("[%eval {:+.2}]", white_cp / 100.0)
}

fn novelty_comment(c: &Candidate, side: Side) -> String {
    let mut parts = vec!["N".to_string(), eval_annotation(c.eval_cp, side)];
    parts.extend(c.per_depth.iter().map(|d: &DepthScore| {
        format!("d{}: {}", d.depth, format_depth_value(white_relative(d.score, side)))
    }));
    parts.push(format!("stability={:.1}cp", c.stability));
    parts.push(format!("pre={}", c.pre_games));
    parts.push(format!("post={}", c.post_games));
    parts.push(format!("score={:.1}", c.score));
    parts.join(" | ")
}

fn novelty_nags(eval_cp: f64) -> Vec<u8> {
    let mut nags = vec![NAG_NOVELTY];
    if eval_cp >= BRILLIANT_CP {
        nags.push(NAG_BRILLIANT);
    } else if eval_cp >= GOOD_CP {
        nags.push(NAG_GOOD);
    }
    nags
}

/// 手順を組み立てる。手番と手数の表記、コメント後の `N...` を扱う。
struct Movetext {
    tokens: Vec<String>,
    position: Position,
    need_number: bool,
}

impl Movetext {
    fn new(root: Position) -> Self {
        Self {
            tokens: Vec::new(),
            position: root,
            need_number: true,
        }
    }

    fn comment(&mut self, text: &str) {
        self.tokens.push(format!("{{{text}}}"));
        self.need_number = true;
    }

    fn play(&mut self, uci: &str) -> Result<(), IllegalMove> {
        let san = self.position.san(uci)?;
        let number = self.position.fullmove_number();
        match self.position.turn() {
            Side::White => self.tokens.push(format!("{number}.")),
            Side::Black if self.need_number => self.tokens.push(format!("{number}...")),
            Side::Black => {}
        }
        self.tokens.push(san);
        self.position = self.position.play_uci(uci)?;
        self.need_number = false;
        Ok(())
    }

    fn nags(&mut self, nags: &[u8]) {
        self.tokens.extend(nags.iter().map(|n| format!("${n}")));
    }

    fn finish(mut self) -> String {
        self.tokens.push("*".to_string());
        wrap(&self.tokens.join(" "), LINE_WIDTH)
    }
}

/// 単語単位で折り返す。`[%...]` は 1 語として扱う。
fn wrap(text: &str, width: usize) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut open: Option<String> = None;
    for w in text.split(' ').filter(|w| !w.is_empty()) {
        match open.take() {
            Some(mut acc) => {
                acc.push(' ');
                acc.push_str(w);
                if w.contains(']') {
                    words.push(acc);
                } else {
                    open = Some(acc);
                }
            }
            None if w.starts_with("[%") && !w.contains(']') => open = Some(w.to_string()),
            None => words.push(w.to_string()),
        }
    }
    words.extend(open);

    let mut out = String::new();
    let mut line_len = 0;
    for w in words {
        if line_len > 0 && line_len + 1 + w.len() > width {
            out.push('\n');
            line_len = 0;
        } else if line_len > 0 {
            out.push(' ');
            line_len += 1;
        }
        out.push_str(&w);
        line_len += w.len();
    }
    out
}

fn escape_header(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// 1 局ぶんの PGN (末尾に空行を含まない)
pub fn render_game(
    root: &Position,
    rank: usize,
    c: &Candidate,
    ctx: &ExportContext,
) -> Result<String, IllegalMove> {
    let mut pre = root.clone();
    for uci in c.book_moves() {
        pre = pre.play_uci(uci)?;
    }
    let novelty_san = pre.san(c.novelty())?;
    let turn_label = if pre.turn() == Side::White { "." } else { "..." };

    let mut summary = format!(
        "Rank {rank} | Score: {:.1} | Novelty: {}{turn_label}{novelty_san} (ply {}) | \
         Eval: {:+.0}cp | Stability: {:.1}cp | Pre-novelty: {} master games | \
         Post-novelty: {} master games",
        c.score,
        pre.fullmove_number(),
        c.ply,
        c.eval_cp,
        c.stability,
        c.pre_games,
        c.post_games,
    );
    if let (Some(player), Some(opponent)) = (&ctx.player, &ctx.opponent) {
        summary.push_str(&format!(" | Prepared for: {player} vs {opponent}"));
    }

    let mut text = Movetext::new(root.clone());
    text.comment(&summary);
    for uci in c.book_moves() {
        text.play(uci)?;
    }
    text.play(c.novelty())?;
    text.nags(&novelty_nags(c.eval_cp));
    text.comment(&novelty_comment(c, ctx.side));
    for uci in &c.pv {
        if text.position.is_game_over() || !text.position.is_legal_uci(uci) {
            break;
        }
        text.play(uci)?;
    }

    let (white, black) = ctx.headers_for_players();
    let mut headers = vec![
        ("Event", "rsecond novelties".to_string()),
        ("Site", "?".to_string()),
        ("Date", ctx.date.format("%Y.%m.%d").to_string()),
        ("Round", rank.to_string()),
        ("White", white),
        ("Black", black),
        ("Result", "*".to_string()),
        ("Annotator", "rsecond".to_string()),
    ];
    if !root.is_startpos() {
        headers.push(("SetUp", "1".to_string()));
        headers.push(("FEN", root.fen()));
    }

    let mut out = String::new();
    for (name, value) in headers {
        out.push_str(&format!("[{name} \"{}\"]\n", escape_header(&value)));
    }
    out.push('\n');
    out.push_str(&text.finish());
    out.push('\n');
    Ok(out)
}

/// 総合点順に書き出す。書けた局数を返す。
pub fn write_pgn<W: Write>(
    out: &mut W,
    root: &Position,
    candidates: &[Candidate],
    ctx: &ExportContext,
) -> std::io::Result<usize> {
    let mut ranked = candidates.to_vec();
    score::rank(&mut ranked);
    let mut written = 0;
    for c in &ranked {
        match render_game(root, written + 1, c, ctx) {
            Ok(game) => {
                if written > 0 {
                    out.write_all(b"\n")?;
                }
                out.write_all(game.as_bytes())?;
                written += 1;
            }
            Err(e) => log::warn!("skipping {}: {e}", c.moves.join(" ")),
        }
    }
    Ok(written)
}

pub fn export_to_path(
    path: &Path,
    root: &Position,
    candidates: &[Candidate],
    ctx: &ExportContext,
) -> Result<usize> {
    let mut w = open_writer(path).with_context(|| format!("open {}", path.display()))?;
    let written = write_pgn(&mut w, root, candidates, ctx)
        .with_context(|| format!("write {}", path.display()))?;
    w.close().with_context(|| format!("close {}", path.display()))?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate() -> Candidate {
        Candidate {
            moves: vec!["e2e4".into(), "e7e5".into(), "g1f3".into(), "b8c6".into(), "f1c4".into()],
            ply: 5,
            pre_games: 1200,
            post_games: 1,
            per_depth: vec![
                DepthScore {
                    depth: 20,
                    score: Score::Cp(30),
                },
                DepthScore {
                    depth: 24,
                    score: Score::Cp(40),
                },
            ],
            eval_cp: 35.0,
            stability: 7.1,
            rarity: 0.59,
            score: 99.4,
            pv: vec!["f8c5".into(), "c2c3".into(), "zz99".into(), "g8f6".into()],
        }
    }

    fn flat(pgn: &str) -> String {
        pgn.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn ctx() -> ExportContext {
        ExportContext::new(NaiveDate::from_ymd_opt(2024, 3, 9).unwrap(), Side::White)
    }

    #[test]
    fn renders_headers_and_annotations() {
        let pgn = render_game(&Position::startpos(), 1, &candidate(), &ctx()).unwrap();
        assert!(pgn.starts_with("[Event \"rsecond novelties\"]\n[Site \"?\"]\n[Date \"2024.03.09\"]\n"));
        assert!(pgn.contains("[Round \"1\"]"));
        assert!(pgn.contains("[Annotator \"rsecond\"]"));
        assert!(!pgn.contains("[FEN "));
        let text = flat(&pgn);
        assert!(text.contains("Novelty: 3.Bc4 (ply 5)"));
        assert!(text.contains("3. Bc4 $146 $1 {N | [%eval +0.35] | d20: +0.30 | d24: +0.40"));
        assert!(text.contains("stability=7.1cp | pre=1200 | post=1 | score=99.4}"));
        // 読み筋は不正な手の手前で止まる
        assert!(text.contains("3... Bc5 4. c3 *"));
        assert!(!pgn.contains("Nf6"));
        assert!(pgn.lines().all(|l| l.len() <= LINE_WIDTH));
    }

    #[test]
    fn black_side_flips_to_white_relative_and_sets_fen() {
        let root = Position::parse("position startpos moves e2e4").unwrap();
        let c = Candidate {
            moves: vec!["a7a6".into()],
            ply: 1,
            pre_games: 50,
            post_games: 0,
            per_depth: vec![DepthScore {
                depth: 18,
                score: Score::Mate(3),
            }],
            eval_cp: 10_000.0,
            stability: 0.0,
            rarity: 1.0,
            score: 10_050.0,
            pv: Vec::new(),
        };
        let mut ctx = ctx();
        ctx.side = Side::Black;
        ctx.player = Some("alice".into());
        ctx.opponent = Some("bob".into());
        let pgn = render_game(&root, 2, &c, &ctx).unwrap();
        assert!(pgn.contains("[White \"bob\"]\n[Black \"alice\"]"));
        assert!(pgn.contains("[SetUp \"1\"]"));
        let text = flat(&pgn);
        assert!(text.contains("Novelty: 1...a6 (ply 1)"));
        assert!(text.contains("Prepared for: alice vs bob"));
        assert!(text.contains("1... a6 $146 $3 {N | [%eval -100.00] | d18: M-3"));
    }

    #[test]
    fn wrap_keeps_eval_tags_whole() {
        let text = format!("{} [%eval +0.35] tail", "x".repeat(70));
        let wrapped = wrap(&text, 80);
        assert_eq!(wrapped, format!("{}\n[%eval +0.35] tail", "x".repeat(70)));
    }

    #[test]
    fn empty_result_writes_nothing() {
        let mut buf = Vec::new();
        assert_eq!(write_pgn(&mut buf, &Position::startpos(), &[], &ctx()).unwrap(), 0);
        assert!(buf.is_empty());
    }
}
