//! エンジンプール
//!
//! スロットごとにワーカースレッドを 1 本立て、共有キューから評価要求を取る。
//! 評価中の失敗はスロットを再起動して 1 回だけ再評価する。
//! 再起動できないスロットは `Dead` になり、キューから手を引く。
//! 全スロットが `Dead` になった場合は、最後のワーカーが残りの要求にエラーを返し続ける。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

use super::{EngineFactory, Evaluation, Evaluator};
use crate::error::EngineError;
use crate::retry::RetryPolicy;

/// 1 評価あたりの試行回数（初回 + 再起動後の 1 回）
const EVAL_ATTEMPTS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Busy,
    Restarting,
    Dead,
}

#[derive(Clone, Debug, PartialEq)]
pub struct EvalRequest {
    pub fen: String,
    pub depths: Vec<u32>,
    pub time_budget_ms: u64,
}

type Reply = Result<Evaluation, EngineError>;

struct Job {
    request: EvalRequest,
    reply: chan::Sender<Reply>,
}

type SlotStates = Arc<Mutex<Vec<SlotState>>>;

fn set_state(states: &SlotStates, slot: usize, state: SlotState) {
    let mut guard = states.lock().unwrap_or_else(|p| p.into_inner());
    guard[slot] = state;
}

/// 評価中はスロットを `Busy` にし、抜けるときに `Idle` へ戻す。`Dead` はそのまま。
struct BusyGuard<'a> {
    states: &'a SlotStates,
    slot: usize,
}

impl<'a> BusyGuard<'a> {
    fn acquire(states: &'a SlotStates, slot: usize) -> Self {
        set_state(states, slot, SlotState::Busy);
        Self { states, slot }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        let mut guard = self.states.lock().unwrap_or_else(|p| p.into_inner());
        if guard[self.slot] != SlotState::Dead {
            guard[self.slot] = SlotState::Idle;
        }
    }
}

pub struct EnginePool {
    job_tx: chan::Sender<Option<Job>>,
    handles: Vec<JoinHandle<()>>,
    states: SlotStates,
    alive: Arc<AtomicUsize>,
}

impl EnginePool {
    /// `workers` 本のエンジンを起動する。1 本も起動できなければエラー。
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        workers: usize,
        restart: RetryPolicy,
    ) -> Result<Self, EngineError> {
        let workers = workers.max(1);
        let states: SlotStates = Arc::new(Mutex::new(vec![SlotState::Restarting; workers]));
        let mut engines = Vec::with_capacity(workers);
        let mut first_error = None;
        for slot in 0..workers {
            match restart.run(&format!("spawn engine#{slot}"), |_| factory.spawn(slot)) {
                Ok(engine) => {
                    set_state(&states, slot, SlotState::Idle);
                    engines.push(Some(engine));
                }
                Err(e) => {
                    log::warn!("engine#{slot}: {e}");
                    set_state(&states, slot, SlotState::Dead);
                    first_error.get_or_insert(e);
                    engines.push(None);
                }
            }
        }
        let alive_count = engines.iter().filter(|e| e.is_some()).count();
        if alive_count == 0 {
            return Err(first_error.unwrap_or(EngineError::Spawn("no engine slots".to_string())));
        }
        let alive = Arc::new(AtomicUsize::new(alive_count));

        let (job_tx, job_rx) = chan::unbounded::<Option<Job>>();
        let mut handles = Vec::with_capacity(workers);
        for (slot, engine) in engines.into_iter().enumerate() {
            let Some(engine) = engine else {
                continue;
            };
            let worker = SlotWorker {
                slot,
                engine: Some(engine),
                factory: Arc::clone(&factory),
                restart: restart.clone(),
                states: Arc::clone(&states),
                alive: Arc::clone(&alive),
            };
            let rx = job_rx.clone();
            handles.push(thread::spawn(move || worker.run(rx)));
        }
        log::info!("engine pool ready: {alive_count}/{workers} slots");
        Ok(Self {
            job_tx,
            handles,
            states,
            alive,
        })
    }

    pub fn slot_states(&self) -> Vec<SlotState> {
        self.states.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn live_slots(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn evaluate(&self, request: EvalRequest) -> Reply {
        self.evaluate_batch(vec![request]).pop().unwrap_or_else(|| {
            Err(EngineError::Protocol("empty batch reply".to_string()))
        })
    }

    /// まとめて投入し、全件の完了を待つ。結果は要求順。
    pub fn evaluate_batch(&self, requests: Vec<EvalRequest>) -> Vec<Reply> {
        let pending: Vec<Result<chan::Receiver<Reply>, EngineError>> = requests
            .into_iter()
            .map(|request| {
                let (reply, rx) = chan::bounded(1);
                self.job_tx
                    .send(Some(Job { request, reply }))
                    .map(|_| rx)
                    .map_err(|_| EngineError::Unavailable { slot: 0 })
            })
            .collect();
        pending
            .into_iter()
            .map(|rx| {
                rx?.recv()
                    .unwrap_or_else(|_| Err(EngineError::Crashed("worker disconnected".to_string())))
            })
            .collect()
    }
}

impl Drop for EnginePool {
    fn drop(&mut self) {
        for _ in 0..self.handles.len() {
            let _ = self.job_tx.send(None);
        }
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
    }
}

struct SlotWorker {
    slot: usize,
    engine: Option<Box<dyn Evaluator>>,
    factory: Arc<dyn EngineFactory>,
    restart: RetryPolicy,
    states: SlotStates,
    alive: Arc<AtomicUsize>,
}

impl SlotWorker {
    fn run(mut self, rx: chan::Receiver<Option<Job>>) {
        let mut draining = false;
        while let Ok(Some(job)) = rx.recv() {
            if draining {
                let _ = job.reply.send(Err(EngineError::Unavailable { slot: self.slot }));
                continue;
            }
            let result = self.run_job(&job.request);
            let _ = job.reply.send(result);
            if self.engine.is_none() {
                // 最後の生存スロットだけが残りの要求に応答し続ける
                if self.alive.fetch_sub(1, Ordering::SeqCst) > 1 {
                    return;
                }
                log::warn!("all engine slots are dead, remaining evaluations will fail");
                draining = true;
            }
        }
    }

    fn run_job(&mut self, request: &EvalRequest) -> Reply {
        let states = Arc::clone(&self.states);
        let _busy = BusyGuard::acquire(&states, self.slot);
        let mut attempts = 0;
        let mut last = String::new();
        while attempts < EVAL_ATTEMPTS {
            let Some(engine) = self.engine.as_mut() else {
                break;
            };
            attempts += 1;
            match engine.evaluate(&request.fen, &request.depths, request.time_budget_ms) {
                Ok(eval) => return Ok(eval),
                Err(e) => {
                    log::warn!(
                        "engine#{}: evaluation of {} failed (attempt {attempts}/{EVAL_ATTEMPTS}): {e}",
                        self.slot,
                        request.fen
                    );
                    last = e.to_string();
                    self.respawn();
                }
            }
        }
        if attempts == 0 {
            return Err(EngineError::Unavailable { slot: self.slot });
        }
        Err(EngineError::Failed { attempts, last })
    }

    /// 古いプロセスを捨てて起動し直す。失敗したら `Dead`。
    fn respawn(&mut self) {
        set_state(&self.states, self.slot, SlotState::Restarting);
        self.engine = None;
        let slot = self.slot;
        let factory = &self.factory;
        match self.restart.run(&format!("restart engine#{slot}"), |_| factory.spawn(slot)) {
            Ok(engine) => {
                self.engine = Some(engine);
                set_state(&self.states, slot, SlotState::Busy);
            }
            Err(e) => {
                log::error!("engine#{slot}: restart failed, slot is dead: {e}");
                set_state(&self.states, slot, SlotState::Dead);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DepthEval, Score};
    use std::sync::atomic::AtomicU32;

    /// fen が "bad" を含むと失敗し、`spawn_limit` を超える起動は拒否する。
    struct StubFactory {
        spawns: AtomicU32,
        spawn_limit: u32,
    }

    impl StubFactory {
        fn new(spawn_limit: u32) -> Arc<Self> {
            Arc::new(Self {
                spawns: AtomicU32::new(0),
                spawn_limit,
            })
        }
    }

    struct StubEval;

    impl Evaluator for StubEval {
        fn evaluate(&mut self, fen: &str, depths: &[u32], _: u64) -> Reply {
            if fen.contains("bad") {
                return Err(EngineError::Crashed("boom".to_string()));
            }
            Ok(Evaluation {
                per_depth: depths
                    .iter()
                    .map(|&depth| DepthEval {
                        depth,
                        score: Score::Cp(fen.len() as i32),
                        pv: Vec::new(),
                    })
                    .collect(),
            })
        }
    }

    impl EngineFactory for StubFactory {
        fn spawn(&self, _slot: usize) -> Result<Box<dyn Evaluator>, EngineError> {
            if self.spawns.fetch_add(1, Ordering::SeqCst) >= self.spawn_limit {
                return Err(EngineError::Spawn("limit".to_string()));
            }
            Ok(Box::new(StubEval))
        }
    }

    fn request(fen: &str) -> EvalRequest {
        EvalRequest {
            fen: fen.to_string(),
            depths: vec![1, 2],
            time_budget_ms: 10,
        }
    }

    #[test]
    fn batch_results_keep_request_order() {
        let pool = EnginePool::new(StubFactory::new(u32::MAX), 3, RetryPolicy::immediate(1)).unwrap();
        let fens: Vec<String> = (1..=20).map(|n| "x".repeat(n)).collect();
        let results = pool.evaluate_batch(fens.iter().map(|f| request(f)).collect());
        for (fen, result) in fens.iter().zip(results) {
            let eval = result.unwrap();
            assert_eq!(eval.per_depth.len(), 2);
            assert_eq!(eval.per_depth[0].score, Score::Cp(fen.len() as i32));
        }
        assert!(pool.slot_states().iter().all(|s| *s == SlotState::Idle));
    }

    #[test]
    fn failing_position_is_retried_once_then_reported() {
        let factory = StubFactory::new(u32::MAX);
        let pool = EnginePool::new(factory.clone(), 1, RetryPolicy::immediate(1)).unwrap();
        match pool.evaluate(request("bad")) {
            Err(EngineError::Failed { attempts: 2, .. }) => {}
            other => panic!("unexpected: {other:?}"),
        }
        // 初回起動 + 失敗ごとの再起動 2 回
        assert_eq!(factory.spawns.load(Ordering::SeqCst), 3);
        assert!(pool.evaluate(request("good")).is_ok());
        assert_eq!(pool.slot_states(), vec![SlotState::Idle]);
    }

    #[test]
    fn failed_restart_reports_the_single_attempt() {
        let pool = EnginePool::new(StubFactory::new(1), 1, RetryPolicy::immediate(1)).unwrap();
        match pool.evaluate(request("bad")) {
            Err(EngineError::Failed { attempts: 1, last }) => assert!(last.contains("boom")),
            other => panic!("unexpected: {other:?}"),
        }
        assert_eq!(pool.slot_states(), vec![SlotState::Dead]);
    }

    #[test]
    fn dead_pool_answers_instead_of_hanging() {
        // 初回起動分だけ成功し、再起動はすべて失敗する
        let pool = EnginePool::new(StubFactory::new(2), 2, RetryPolicy::immediate(1)).unwrap();
        let results = pool.evaluate_batch(vec![request("bad"), request("bad"), request("good")]);
        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_err()));
        assert_eq!(pool.live_slots(), 0);
        assert_eq!(pool.slot_states(), vec![SlotState::Dead, SlotState::Dead]);
        assert!(matches!(
            pool.evaluate(request("good")),
            Err(EngineError::Unavailable { .. })
        ));
    }

    #[test]
    fn no_engine_at_all_is_an_error() {
        assert!(EnginePool::new(StubFactory::new(0), 2, RetryPolicy::immediate(1)).is_err());
    }
}
