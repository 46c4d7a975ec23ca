//! Shared fixtures for search integration tests

#![allow(dead_code)] // Not every test file uses every helper

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rsecond_core::engine::{DepthEval, EngineFactory, EnginePool, Evaluation, Evaluator, Score};
use rsecond_core::error::{EngineError, FetchError};
use rsecond_core::stats::{MoveStats, PositionStats, StatFilters, StatsCache, StatsClient, StatsSource};
use rsecond_core::{Position, RetryPolicy, RunConfig, SearchConfig};

/// Masters statistics keyed by position key. Unknown positions are a permanent miss.
#[derive(Clone, Default)]
pub struct Book {
    rows: HashMap<String, PositionStats>,
}

impl Book {
    /// `line` is a "position startpos moves ..." string; every listed move gets `white` wins.
    pub fn set<S: AsRef<str>>(&mut self, line: &str, moves: &[(S, u64)]) -> &mut Self {
        let pos = Position::parse(line).unwrap();
        let stats = PositionStats {
            white: moves.iter().map(|(_, n)| n).sum(),
            draws: 0,
            black: 0,
            moves: moves
                .iter()
                .map(|(uci, n)| MoveStats {
                    uci: uci.as_ref().to_string(),
                    white: *n,
                    ..MoveStats::default()
                })
                .collect(),
        };
        self.rows.insert(pos.key(), stats);
        self
    }

    pub fn games(&self, pos: &Position, uci: &str) -> u64 {
        self.rows.get(&pos.key()).map_or(0, |s| s.games_for_move(uci))
    }
}

impl StatsSource for Book {
    fn fetch(&self, fen: &str, _filters: &StatFilters) -> Result<PositionStats, FetchError> {
        let key = Position::from_fen(fen).unwrap().key();
        self.rows
            .get(&key)
            .cloned()
            .ok_or_else(|| FetchError::Permanent(format!("no data for {key}")))
    }
}

pub fn stats_client(book: &Book) -> StatsClient {
    let cache = Arc::new(StatsCache::open_in_memory().unwrap());
    StatsClient::new(cache, Box::new(book.clone()), RetryPolicy::immediate(1))
}

type EvalFn = dyn Fn(&Position, u32) -> Result<i32, EngineError> + Send + Sync;

/// Answers each requested depth with a side-to-move centipawn score.
#[derive(Clone)]
pub struct StubEngines {
    eval: Arc<EvalFn>,
    pv: Vec<String>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl StubEngines {
    /// The same score at every depth.
    pub fn new<F>(eval: F) -> Self
    where
        F: Fn(&Position) -> Result<i32, EngineError> + Send + Sync + 'static,
    {
        Self::per_depth(move |pos, _| eval(pos))
    }

    pub fn per_depth<F>(eval: F) -> Self
    where
        F: Fn(&Position, u32) -> Result<i32, EngineError> + Send + Sync + 'static,
    {
        Self {
            eval: Arc::new(eval),
            pv: Vec::new(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn constant(cp: i32) -> Self {
        Self::new(move |_| Ok(cp))
    }

    pub fn with_pv(mut self, pv: &[&str]) -> Self {
        self.pv = pv.iter().map(|m| m.to_string()).collect();
        self
    }

    pub fn pool(&self, workers: usize) -> EnginePool {
        EnginePool::new(Arc::new(self.clone()), workers, RetryPolicy::immediate(1)).unwrap()
    }

    pub fn evaluated_keys(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

struct StubEvaluator(StubEngines);

impl Evaluator for StubEvaluator {
    fn evaluate(&mut self, fen: &str, depths: &[u32], _: u64) -> Result<Evaluation, EngineError> {
        let pos = Position::from_fen(fen).unwrap();
        self.0.calls.lock().unwrap().push(pos.key());
        let per_depth = depths
            .iter()
            .map(|&depth| {
                Ok(DepthEval {
                    depth,
                    score: Score::Cp((self.0.eval)(&pos, depth)?),
                    pv: self.0.pv.clone(),
                })
            })
            .collect::<Result<_, EngineError>>()?;
        Ok(Evaluation { per_depth })
    }
}

impl EngineFactory for StubEngines {
    fn spawn(&self, _slot: usize) -> Result<Box<dyn Evaluator>, EngineError> {
        Ok(Box::new(StubEvaluator(self.clone())))
    }
}

pub fn config(overrides: impl FnOnce(&mut RunConfig)) -> SearchConfig {
    let mut cfg = RunConfig {
        depths: vec![8, 12],
        time_budget_ms: 10,
        workers: 2,
        ..RunConfig::default()
    };
    overrides(&mut cfg);
    cfg.validate().unwrap()
}

/// Key of the position reached by `line`.
pub fn key(line: &str) -> String {
    Position::parse(line).unwrap().key()
}

/// Every legal root move at `games`, with the listed overrides.
pub fn all_moves_at(pos: &Position, games: u64, overrides: &[(&str, u64)]) -> Vec<(String, u64)> {
    pos.legal_moves_uci()
        .into_iter()
        .map(|uci| {
            let n = overrides
                .iter()
                .find(|(m, _)| *m == uci)
                .map_or(games, |(_, n)| *n);
            (uci, n)
        })
        .collect()
}
