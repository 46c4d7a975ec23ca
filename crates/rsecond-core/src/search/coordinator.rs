//! 手数単位で進む探索ループ
//!
//! 1 手ごとに、フロンティア各局面の統計をまとめて引き、指し手を分類し、
//! 候補手の評価をプールへ一括投入して全件の完了を待ってから次の手へ進む。
//!
//! 訪問局面数 = 根以外で展開した局面 + 評価を投入した候補局面。
//! 上限は展開・投入の直前に確認し、到達したらその手で打ち切る。

use std::collections::HashSet;

use rayon::prelude::*;

use super::classify::{classify_moves, popular_replies, CountedMove, Thresholds};
use super::tree::{NodeId, SearchTree};
use super::{Candidate, DepthScore};
use crate::config::{CompanionConfig, SearchConfig};
use crate::engine::{EnginePool, EvalRequest, Evaluation};
use crate::position::{Position, Side};
use crate::score;
use crate::stats::{PositionStats, StatFilters, StatsClient};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Termination {
    MaxPlies,
    FrontierEmpty,
    PositionBudget,
}

impl Termination {
    pub fn label(self) -> &'static str {
        match self {
            Termination::MaxPlies => "max plies reached",
            Termination::FrontierEmpty => "frontier exhausted",
            Termination::PositionBudget => "position budget exhausted",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SearchReport {
    /// 総合点順
    pub candidates: Vec<Candidate>,
    pub positions_visited: usize,
    pub plies_completed: u32,
    pub termination: Termination,
    /// 再評価後も失敗した候補
    pub failed_evaluations: usize,
    /// 統計が得られず展開できなかった局面
    pub abandoned_lines: usize,
}

/// プレイヤー / 対戦相手の対局履歴。キャッシュからのみ読む。
pub struct Repertoire {
    index: StatsClient,
    player: Option<StatFilters>,
    opponent: Option<StatFilters>,
    min_player_games: u64,
    min_opponent_games: u64,
}

impl Repertoire {
    /// `companion` にユーザー名が無ければ `None`。
    pub fn new(index: StatsClient, companion: &CompanionConfig, side: Side) -> Option<Self> {
        if !companion.is_active() {
            return None;
        }
        Some(Self {
            index,
            player: companion
                .player
                .as_deref()
                .map(|u| StatFilters::player(u, side, &companion.player_speeds)),
            opponent: companion
                .opponent
                .as_deref()
                .map(|u| StatFilters::player(u, side.opposite(), &companion.opponent_speeds)),
            min_player_games: companion.min_player_games,
            min_opponent_games: companion.min_opponent_games,
        })
    }

    fn player_stats(&self, position: &Position) -> Option<PositionStats> {
        self.index.lookup(position, self.player.as_ref()?)
    }

    fn opponent_stats(&self, position: &Position) -> Option<PositionStats> {
        self.index.lookup(position, self.opponent.as_ref()?)
    }
}

/// フロンティア 1 局面ぶんの統計
struct Lookup {
    masters: Option<PositionStats>,
    personal: Option<PositionStats>,
}

/// 評価待ちの候補局面
struct Pending {
    node: NodeId,
    pre_games: u64,
}

pub struct Coordinator<'a> {
    config: &'a SearchConfig,
    stats: &'a StatsClient,
    pool: &'a EnginePool,
    repertoire: Option<&'a Repertoire>,
    thresholds: Thresholds,
}

impl<'a> Coordinator<'a> {
    pub fn new(config: &'a SearchConfig, stats: &'a StatsClient, pool: &'a EnginePool) -> Self {
        let p = config.params();
        Self {
            config,
            stats,
            pool,
            repertoire: None,
            thresholds: Thresholds {
                min_book_games: p.min_book_games,
                novelty_threshold: p.novelty_threshold,
                inclusive: p.novelty_inclusive,
            },
        }
    }

    pub fn with_repertoire(mut self, repertoire: &'a Repertoire) -> Self {
        self.repertoire = Some(repertoire);
        self
    }

    pub fn run(&self) -> SearchReport {
        let p = self.config.params();
        let side = p.side;
        let mut tree = SearchTree::new(self.config.root().clone());
        let root = tree.root();
        let mut frontier = vec![root];
        let mut seen: HashSet<String> = HashSet::from([self.config.root().key()]);
        let mut evaluated: HashSet<String> = HashSet::new();

        let mut visited = 0usize;
        let mut retained: Vec<Candidate> = Vec::new();
        let mut failed_evaluations = 0usize;
        let mut abandoned_lines = 0usize;
        let mut plies_completed = 0u32;
        let mut termination = Termination::MaxPlies;

        for ply in 0..p.max_plies {
            let mut budget_hit = false;

            let mut expand = Vec::with_capacity(frontier.len());
            for &id in &frontier {
                if id != root {
                    if visited >= p.max_positions {
                        budget_hit = true;
                        break;
                    }
                    visited += 1;
                }
                expand.push(id);
            }

            let lookups: Vec<Lookup> = expand
                .par_iter()
                .map(|&id| self.lookup(&tree.get(id).position, side))
                .collect();

            let mut next: Vec<NodeId> = Vec::new();
            let mut pending: Vec<Pending> = Vec::new();
            for (&id, lookup) in expand.iter().zip(lookups) {
                let Some(stats) = lookup.masters else {
                    log::debug!("no statistics for {}, line abandoned", tree.path_string(id));
                    abandoned_lines += 1;
                    continue;
                };
                if !self.thresholds.in_book(&stats) {
                    log::debug!(
                        "out of book after {} ({} games)",
                        tree.path_string(id),
                        stats.total()
                    );
                    continue;
                }
                let position = tree.get(id).position.clone();
                if position.turn() == side {
                    let classified = classify_moves(&position, &stats, &self.thresholds);
                    for (uci, count) in classified.candidates {
                        let Ok(child) = position.play_uci(&uci) else {
                            continue;
                        };
                        if !evaluated.insert(child.key()) {
                            continue;
                        }
                        let node = tree.push_child(id, uci, child, count);
                        pending.push(Pending {
                            node,
                            pre_games: stats.total(),
                        });
                    }
                    let book = self.restrict_to_player(classified.book, lookup.personal.as_ref());
                    self.push_continuations(&mut tree, id, &position, book, &mut seen, &mut next);
                } else {
                    let replies = self.opponent_replies(&position, &stats, lookup.personal.as_ref());
                    self.push_continuations(&mut tree, id, &position, replies, &mut seen, &mut next);
                }
            }

            let mut requests = Vec::with_capacity(pending.len());
            let mut dispatched = Vec::with_capacity(pending.len());
            for item in pending {
                if visited >= p.max_positions {
                    budget_hit = true;
                    break;
                }
                visited += 1;
                requests.push(EvalRequest {
                    fen: tree.get(item.node).position.fen(),
                    depths: p.depths.clone(),
                    time_budget_ms: p.time_budget_ms,
                });
                dispatched.push(item);
            }

            let results = if requests.is_empty() {
                Vec::new()
            } else {
                self.pool.evaluate_batch(requests)
            };
            let mut scored = Vec::with_capacity(results.len());
            for (item, result) in dispatched.iter().zip(results) {
                match result {
                    Ok(evaluation) => {
                        if let Some(candidate) = self.build_candidate(&tree, item, &evaluation) {
                            scored.push(candidate);
                        }
                    }
                    Err(e) => {
                        failed_evaluations += 1;
                        log::warn!("evaluation failed for {}: {e}", tree.path_string(item.node));
                    }
                }
            }
            score::rank(&mut scored);
            scored.truncate(p.beam);

            prune_by_games(&tree, &mut next, p.beam);
            log::info!(
                "ply {}: expanded {}, evaluated {}, kept {} candidates, next frontier {}",
                ply + 1,
                expand.len(),
                dispatched.len(),
                scored.len(),
                next.len()
            );
            retained.extend(scored);
            plies_completed = ply + 1;

            if budget_hit {
                termination = Termination::PositionBudget;
                break;
            }
            if next.is_empty() {
                termination = Termination::FrontierEmpty;
                break;
            }
            frontier = next;
        }

        score::rank(&mut retained);
        log::info!(
            "search finished ({}): {} candidates, {} positions visited",
            termination.label(),
            retained.len(),
            visited
        );
        SearchReport {
            candidates: retained,
            positions_visited: visited,
            plies_completed,
            termination,
            failed_evaluations,
            abandoned_lines,
        }
    }

    fn lookup(&self, position: &Position, side: Side) -> Lookup {
        let masters = self.stats.lookup(position, &StatFilters::Masters);
        let personal = match (masters.as_ref(), self.repertoire) {
            (Some(_), Some(rep)) if position.turn() == side => rep.player_stats(position),
            (Some(_), Some(rep)) => rep.opponent_stats(position),
            _ => None,
        };
        Lookup { masters, personal }
    }

    /// プレイヤーの履歴があれば、本人が十分指した定跡手だけに絞る。
    fn restrict_to_player(
        &self,
        book: Vec<CountedMove>,
        player: Option<&PositionStats>,
    ) -> Vec<CountedMove> {
        match (self.repertoire, player) {
            (Some(rep), Some(stats)) => book
                .into_iter()
                .filter(|(uci, _)| stats.games_for_move(uci) >= rep.min_player_games)
                .collect(),
            _ => book,
        }
    }

    /// 相手の履歴に十分な手があればそれを、なければマスター戦の頻出手を辿る。
    fn opponent_replies(
        &self,
        position: &Position,
        masters: &PositionStats,
        opponent: Option<&PositionStats>,
    ) -> Vec<CountedMove> {
        let limit = self.config.params().opponent_responses;
        if let (Some(rep), Some(stats)) = (self.repertoire, opponent) {
            let own = popular_replies(position, stats, rep.min_opponent_games, limit);
            if !own.is_empty() {
                return own;
            }
        }
        popular_replies(position, masters, self.thresholds.min_book_games, limit)
    }

    fn push_continuations(
        &self,
        tree: &mut SearchTree,
        parent: NodeId,
        position: &Position,
        moves: Vec<CountedMove>,
        seen: &mut HashSet<String>,
        next: &mut Vec<NodeId>,
    ) {
        for (uci, count) in moves {
            let Ok(child) = position.play_uci(&uci) else {
                continue;
            };
            if !seen.insert(child.key()) {
                log::debug!("transposition after {} {uci}", tree.path_string(parent));
                continue;
            }
            next.push(tree.push_child(parent, uci, child, count));
        }
    }

    fn build_candidate(
        &self,
        tree: &SearchTree,
        item: &Pending,
        evaluation: &Evaluation,
    ) -> Option<Candidate> {
        let p = self.config.params();
        let node = tree.get(item.node);
        // エンジンの評価は新手を指された側 (相手) の手番視点
        let flip = node.position.turn() != p.side;
        let per_depth: Vec<DepthScore> = evaluation
            .per_depth
            .iter()
            .map(|d| DepthScore {
                depth: d.depth,
                score: if flip { d.score.negate() } else { d.score },
            })
            .collect();
        let cps: Vec<i32> = evaluation
            .per_depth
            .iter()
            .map(|d| if flip { -d.score.to_cp() } else { d.score.to_cp() })
            .collect();
        let breakdown = score::score_line(&cps, node.prior_count)?;
        let moves = tree.path(item.node);
        if breakdown.eval_cp < p.min_eval {
            log::debug!(
                "{} below eval floor ({:.1}cp)",
                moves.join(" "),
                breakdown.eval_cp
            );
            return None;
        }
        let mut pv = evaluation.principal_variation().to_vec();
        pv.truncate(p.continuations);
        Some(Candidate {
            ply: node.ply,
            moves,
            pre_games: item.pre_games,
            post_games: node.prior_count,
            per_depth,
            eval_cp: breakdown.eval_cp,
            stability: breakdown.stability,
            rarity: breakdown.rarity,
            score: breakdown.score,
            pv,
        })
    }
}

/// 対局数の多い順 (同数は手順の文字列順) に `beam` 件まで残す。
fn prune_by_games(tree: &SearchTree, next: &mut Vec<NodeId>, beam: usize) {
    let mut keyed: Vec<(u64, String, NodeId)> = next
        .iter()
        .map(|&id| (tree.get(id).prior_count, tree.path_string(id), id))
        .collect();
    keyed.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    keyed.truncate(beam);
    *next = keyed.into_iter().map(|(_, _, id)| id).collect();
}
