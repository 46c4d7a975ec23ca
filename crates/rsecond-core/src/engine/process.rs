use std::collections::HashSet;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

use super::info::InfoSnapshot;
use super::{DepthEval, EngineFactory, Evaluation, Evaluator};
use crate::error::EngineError;

pub const ENGINE_READY_TIMEOUT: Duration = Duration::from_secs(30);
pub const ENGINE_QUIT_TIMEOUT: Duration = Duration::from_millis(300);
pub const ENGINE_QUIT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const ENGINE_PATH_ENV: &str = "RSECOND_STOCKFISH_PATH";

/// エンジンプロセス起動時の設定。
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub path: PathBuf,
    pub args: Vec<String>,
    pub threads: usize,
    pub hash_mb: u32,
    /// movetime を超えてから stop を送るまでの猶予
    pub timeout_margin_ms: u64,
    /// 追加の UCI オプション (Name=Value 形式)
    pub uci_options: Vec<String>,
}

impl EngineConfig {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            args: Vec::new(),
            threads: 1,
            hash_mb: 256,
            timeout_margin_ms: 1_000,
            uci_options: Vec::new(),
        }
    }
}

/// UCI エンジン 1 本の入出力をカプセル化する。
pub struct UciEngine {
    child: Child,
    stdin: BufWriter<ChildStdin>,
    rx: Receiver<String>,
    opt_names: HashSet<String>,
    timeout_margin_ms: u64,
    pub label: String,
}

impl UciEngine {
    pub fn spawn(cfg: &EngineConfig, label: String) -> Result<Self> {
        let mut cmd = Command::new(&cfg.path);
        if !cfg.args.is_empty() {
            cmd.args(&cfg.args);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn engine at {}", cfg.path.display()))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow!("no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow!("no stdout"))?;
        let (tx, rx) = mpsc::channel::<String>();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(l) => {
                        if tx.send(l).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
        });

        let mut proc = Self {
            child,
            stdin: BufWriter::new(stdin),
            rx,
            opt_names: HashSet::new(),
            timeout_margin_ms: cfg.timeout_margin_ms,
            label,
        };
        proc.initialize(cfg)?;
        Ok(proc)
    }

    fn initialize(&mut self, cfg: &EngineConfig) -> Result<()> {
        self.write_line("uci")?;
        loop {
            let line = self.recv_line(ENGINE_READY_TIMEOUT)?;
            if let Some(rest) = line.strip_prefix("option ") {
                if let Some(name) = parse_option_name(rest) {
                    self.opt_names.insert(name);
                }
            } else if line == "uciok" {
                break;
            }
        }
        self.set_option_if_available("Threads", &cfg.threads.to_string())?;
        self.set_option_if_available("Hash", &cfg.hash_mb.to_string())?;
        for opt in &cfg.uci_options {
            if let Some((name, value)) = opt.split_once('=') {
                self.set_option_if_available(name.trim(), value.trim())?;
            } else {
                // "=" がない場合はボタン型とみなし、値なしで送る
                self.write_line(&format!("setoption name {}", opt.trim()))?;
            }
        }
        self.new_game()
    }

    pub fn new_game(&mut self) -> Result<()> {
        self.write_line("ucinewgame")?;
        self.sync_ready()
    }

    /// 1 つの深さで探索し、最後に受け取った multipv=1 の info を返す。
    ///
    /// `movetime` の後 `timeout_margin_ms` で `stop` を送り、
    /// さらに同じだけ待っても `bestmove` が来なければエラーにする。
    pub fn search_depth(&mut self, fen: &str, depth: u32, movetime_ms: u64) -> Result<DepthEval> {
        self.write_line(&format!("position fen {fen}"))?;
        self.write_line(&format!("go depth {depth} movetime {movetime_ms}"))?;

        let start = Instant::now();
        let soft_limit = Duration::from_millis(movetime_ms.saturating_add(self.timeout_margin_ms));
        let hard_limit = soft_limit + Duration::from_millis(self.timeout_margin_ms);
        let mut stop_sent = false;
        let mut snapshot = InfoSnapshot::default();

        loop {
            let deadline = if stop_sent { hard_limit } else { soft_limit };
            let remaining = deadline.saturating_sub(start.elapsed());
            match self.rx.recv_timeout(remaining) {
                Ok(line) => {
                    if line.starts_with("info") {
                        snapshot.update_from_line(&line);
                        continue;
                    }
                    if line.starts_with("bestmove") {
                        let score = snapshot
                            .score
                            .ok_or_else(|| anyhow!("{}: bestmove without score", self.label))?;
                        return Ok(DepthEval {
                            depth,
                            score,
                            pv: snapshot.pv,
                        });
                    }
                }
                Err(RecvTimeoutError::Timeout) => {
                    if stop_sent {
                        bail!("{}: no bestmove after stop", self.label);
                    }
                    self.write_line("stop")?;
                    stop_sent = true;
                }
                Err(RecvTimeoutError::Disconnected) => {
                    bail!("{}: engine exited unexpectedly", self.label);
                }
            }
        }
    }

    pub fn sync_ready(&mut self) -> Result<()> {
        self.write_line("isready")?;
        loop {
            let line = self.recv_line(ENGINE_READY_TIMEOUT)?;
            if line == "readyok" {
                break;
            }
        }
        Ok(())
    }

    pub fn recv_line(&self, timeout: Duration) -> Result<String> {
        self.rx.recv_timeout(timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => anyhow!("{}: engine read timeout", self.label),
            RecvTimeoutError::Disconnected => anyhow!("{}: engine exited unexpectedly", self.label),
        })
    }

    pub fn set_option_if_available(&mut self, name: &str, value: &str) -> Result<()> {
        if self.opt_names.is_empty() || self.opt_names.contains(name) {
            self.write_line(&format!("setoption name {name} value {value}"))?;
        } else {
            log::debug!("{}: option {name} not advertised, skipped", self.label);
        }
        Ok(())
    }

    pub fn write_line(&mut self, msg: &str) -> Result<()> {
        self.stdin.write_all(msg.as_bytes())?;
        self.stdin.write_all(b"\n")?;
        self.stdin.flush()?;
        Ok(())
    }

    /// プロセスが終了していれば true
    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    fn classify(&mut self, err: anyhow::Error) -> EngineError {
        if self.has_exited() {
            EngineError::Crashed(format!("{err:#}"))
        } else {
            EngineError::Protocol(format!("{err:#}"))
        }
    }
}

impl Evaluator for UciEngine {
    fn evaluate(
        &mut self,
        fen: &str,
        depths: &[u32],
        time_budget_ms: u64,
    ) -> Result<Evaluation, EngineError> {
        if let Err(e) = self.new_game() {
            return Err(self.classify(e));
        }
        let mut per_depth = Vec::with_capacity(depths.len());
        for &depth in depths {
            match self.search_depth(fen, depth, time_budget_ms) {
                Ok(eval) => per_depth.push(eval),
                Err(e) => return Err(self.classify(e)),
            }
        }
        Ok(Evaluation { per_depth })
    }
}

impl Drop for UciEngine {
    fn drop(&mut self) {
        let _ = self.write_line("quit");
        let deadline = Instant::now() + ENGINE_QUIT_TIMEOUT;
        while Instant::now() < deadline {
            if let Ok(Some(_)) = self.child.try_wait() {
                return;
            }
            std::thread::sleep(ENGINE_QUIT_POLL_INTERVAL);
        }
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn parse_option_name(line: &str) -> Option<String> {
    let mut tokens = line.split_whitespace().peekable();
    while let Some(tok) = tokens.next() {
        if tok == "name" {
            let mut parts = Vec::new();
            while let Some(next) = tokens.next_if(|t| *t != "type") {
                parts.push(next.to_string());
            }
            if !parts.is_empty() {
                return Some(parts.join(" "));
            }
        }
    }
    None
}

/// 同じ設定で UCI エンジンを起動するファクトリ
pub struct UciEngineFactory {
    config: EngineConfig,
}

impl UciEngineFactory {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }
}

impl EngineFactory for UciEngineFactory {
    fn spawn(&self, slot: usize) -> Result<Box<dyn Evaluator>, EngineError> {
        let engine = UciEngine::spawn(&self.config, format!("engine#{slot}"))
            .map_err(|e| EngineError::Spawn(format!("{e:#}")))?;
        Ok(Box::new(engine))
    }
}

/// エンジンバイナリを解決する。明示指定、環境変数、PATH 上の `stockfish` の順。
pub fn find_engine(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.is_file().then(|| path.to_path_buf());
    }
    if let Some(path) = std::env::var_os(ENGINE_PATH_ENV).map(PathBuf::from) {
        if path.is_file() {
            return Some(path);
        }
        log::warn!("{ENGINE_PATH_ENV}={} is not a file", path.display());
    }
    find_in_path("stockfish")
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    #[cfg(windows)]
    let names = [format!("{name}.exe")];
    #[cfg(not(windows))]
    let names = [name.to_string()];

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .flat_map(|dir| names.iter().map(move |n| dir.join(n)))
        .find(|candidate| candidate.is_file())
}
