use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rsecond_core::engine::{find_engine, EngineConfig, EnginePool, UciEngineFactory};
use rsecond_core::export::{export_to_path, ExportContext};
use rsecond_core::search::{Coordinator, Repertoire, SearchReport};
use rsecond_core::stats::{LichessExplorer, StatsCache, StatsClient};
use rsecond_core::{Position, RetryPolicy, RunConfig, Side};

const DEFAULT_CACHE: &str = "data/cache.sqlite";
const SUMMARY_LINES: usize = 5;

#[derive(Parser, Debug)]
#[command(author, version, about = "Search opening trees for strong, rarely played moves")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 新手を探索して PGN に書き出す
    Search(SearchArgs),
    /// キャッシュの backend ごとの件数を表示する
    CacheInfo(CacheInfoArgs),
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// 設定ファイル (TOML)。以降のフラグで上書きする
    #[arg(long)]
    config: Option<PathBuf>,

    /// 調査する手番 (white / black)
    #[arg(long, value_parser = parse_side)]
    side: Option<Side>,

    /// 開始局面 (FEN / startpos / "position ... moves ...")
    #[arg(long)]
    fen: Option<String>,

    /// 根から辿る最大手数
    #[arg(long)]
    plies: Option<u32>,

    /// 1 手あたりに残す局面数
    #[arg(long)]
    beam: Option<usize>,

    /// 評価する深さ (カンマ区切り)
    #[arg(long, value_delimiter = ',')]
    depths: Option<Vec<u32>>,

    /// 1 深さあたりの思考時間 (ms)
    #[arg(long = "time-ms")]
    time_ms: Option<u64>,

    /// エンジンプロセス数
    #[arg(long)]
    workers: Option<usize>,

    #[arg(long)]
    max_positions: Option<usize>,

    /// 定跡手とみなす最小対局数
    #[arg(long)]
    min_book_games: Option<u64>,

    /// 新手とみなす対局数の上限 (未満)
    #[arg(long)]
    novelty_threshold: Option<u64>,

    /// novelty_threshold ちょうども新手に含める
    #[arg(long)]
    novelty_inclusive: bool,

    #[arg(long)]
    opponent_responses: Option<usize>,

    /// 新手の後に付ける読み筋の手数
    #[arg(long)]
    continuations: Option<usize>,

    /// 残す候補の評価値下限 (centipawn, 調査側視点)
    #[arg(long, allow_hyphen_values = true)]
    min_eval: Option<f64>,

    /// 出力先 (`-` で標準出力、`.gz` で圧縮)
    #[arg(long)]
    out: Option<PathBuf>,

    /// エンジンバイナリ (未指定時: $RSECOND_STOCKFISH_PATH, PATH 上の stockfish)
    #[arg(long)]
    engine: Option<PathBuf>,

    /// エンジン追加引数
    #[arg(long, num_args = 1..)]
    engine_args: Option<Vec<String>>,

    /// Threads option
    #[arg(long, default_value_t = 1)]
    threads: usize,

    /// Hash (MiB)
    #[arg(long, default_value_t = 256)]
    hash_mb: u32,

    /// movetime 超過後に stop を送るまでの猶予 (ms)
    #[arg(long, default_value_t = 1000)]
    timeout_margin_ms: u64,

    /// 追加の UCI オプション (Name=Value、複数可)
    #[arg(long = "uci-option")]
    uci_options: Vec<String>,

    #[arg(long, default_value = DEFAULT_CACHE)]
    cache: PathBuf,

    /// 研究対象プレイヤー (Lichess ユーザー名)
    #[arg(long)]
    player: Option<String>,

    /// 対戦相手 (Lichess ユーザー名)
    #[arg(long)]
    opponent: Option<String>,

    #[arg(long)]
    player_speeds: Option<String>,

    #[arg(long)]
    opponent_speeds: Option<String>,

    #[arg(long)]
    min_player_games: Option<u64>,

    #[arg(long)]
    min_opponent_games: Option<u64>,

    /// キャッシュに無いプレイヤー / 対戦相手の履歴を explorer から取得する
    #[arg(long)]
    player_live: bool,

    /// ネットワークに出ず、キャッシュだけで探索する
    #[arg(long)]
    offline: bool,
}

#[derive(Args, Debug)]
struct CacheInfoArgs {
    #[arg(long, default_value = DEFAULT_CACHE)]
    cache: PathBuf,
}

fn parse_side(s: &str) -> Result<Side, String> {
    s.parse::<Side>().map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Search(args) => run_search(args),
        Command::CacheInfo(args) => cache_info(&args.cache),
    }
}

/// 設定ファイルを読み、指定されたフラグだけ上書きする。
fn build_config(args: &SearchArgs) -> Result<RunConfig> {
    let mut cfg = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            RunConfig::from_toml_str(&text)
                .with_context(|| format!("invalid config {}", path.display()))?
        }
        None => RunConfig::default(),
    };
    if let Some(v) = args.side {
        cfg.side = v;
    }
    if let Some(v) = &args.fen {
        cfg.root = v.clone();
    }
    if let Some(v) = args.plies {
        cfg.max_plies = v;
    }
    if let Some(v) = args.beam {
        cfg.beam = v;
    }
    if let Some(v) = &args.depths {
        cfg.depths = v.clone();
    }
    if let Some(v) = args.time_ms {
        cfg.time_budget_ms = v;
    }
    if let Some(v) = args.workers {
        cfg.workers = v;
    }
    if let Some(v) = args.max_positions {
        cfg.max_positions = v;
    }
    if let Some(v) = args.min_book_games {
        cfg.min_book_games = v;
    }
    if let Some(v) = args.novelty_threshold {
        cfg.novelty_threshold = v;
    }
    if args.novelty_inclusive {
        cfg.novelty_inclusive = true;
    }
    if let Some(v) = args.opponent_responses {
        cfg.opponent_responses = v;
    }
    if let Some(v) = args.continuations {
        cfg.continuations = v;
    }
    if let Some(v) = args.min_eval {
        cfg.min_eval = v;
    }
    if let Some(v) = &args.out {
        cfg.output = v.clone();
    }
    let companion = &mut cfg.companion;
    if let Some(v) = &args.player {
        companion.player = Some(v.clone());
    }
    if let Some(v) = &args.opponent {
        companion.opponent = Some(v.clone());
    }
    if let Some(v) = &args.player_speeds {
        companion.player_speeds = v.clone();
    }
    if let Some(v) = &args.opponent_speeds {
        companion.opponent_speeds = v.clone();
    }
    if let Some(v) = args.min_player_games {
        companion.min_player_games = v;
    }
    if let Some(v) = args.min_opponent_games {
        companion.min_opponent_games = v;
    }
    if args.player_live {
        companion.live = true;
    }
    Ok(cfg)
}

fn run_search(args: SearchArgs) -> Result<()> {
    let config = build_config(&args)?.validate()?;
    let params = config.params();

    let Some(engine_path) = find_engine(args.engine.as_deref()) else {
        bail!("engine binary not found (use --engine or set RSECOND_STOCKFISH_PATH)");
    };
    let engine = EngineConfig {
        args: args.engine_args.clone().unwrap_or_default(),
        threads: args.threads,
        hash_mb: args.hash_mb,
        timeout_margin_ms: args.timeout_margin_ms,
        uci_options: args.uci_options.clone(),
        ..EngineConfig::new(engine_path)
    };

    let cache = Arc::new(
        StatsCache::open(&args.cache)
            .with_context(|| format!("failed to open cache {}", args.cache.display()))?,
    );
    let explorer = if args.offline {
        None
    } else {
        Some(Arc::new(LichessExplorer::from_env()?))
    };
    let networked = |source: &Arc<LichessExplorer>| {
        StatsClient::new(Arc::clone(&cache), Box::new(Arc::clone(source)), RetryPolicy::default())
    };
    let stats = match &explorer {
        Some(source) => networked(source),
        None => StatsClient::local_only(Arc::clone(&cache)),
    };
    let index = match &explorer {
        Some(source) if params.companion.live => networked(source),
        _ => StatsClient::local_only(Arc::clone(&cache)),
    };
    let repertoire = Repertoire::new(index, &params.companion, params.side);

    log::info!(
        "searching {} for {} (plies={}, beam={}, depths={:?}, workers={})",
        config.root().fen(),
        params.side,
        params.max_plies,
        params.beam,
        params.depths,
        params.workers
    );
    let restart = RetryPolicy {
        max_attempts: 2,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(2),
        jitter: 0.1,
    };
    let pool = EnginePool::new(
        Arc::new(UciEngineFactory::new(engine.clone())),
        params.workers,
        restart,
    )
    .with_context(|| format!("failed to start engine {}", engine.path.display()))?;

    let mut coordinator = Coordinator::new(&config, &stats, &pool);
    if let Some(rep) = &repertoire {
        coordinator = coordinator.with_repertoire(rep);
    }
    let report = coordinator.run();
    drop(pool);

    let ctx = ExportContext {
        player: params.companion.player.clone(),
        opponent: params.companion.opponent.clone(),
        ..ExportContext::new(chrono::Local::now().date_naive(), params.side)
    };
    let written = export_to_path(&params.output, config.root(), &report.candidates, &ctx)?;

    let summary = render_summary(&report, config.root(), written, &params.output);
    if params.output.as_os_str() == "-" {
        for line in summary.lines() {
            log::info!("{line}");
        }
    } else {
        print!("{summary}");
    }
    Ok(())
}

fn render_summary(report: &SearchReport, root: &Position, written: usize, out: &Path) -> String {
    let mut s = String::new();
    s.push_str("=== Novelty Search Complete ===\n");
    s.push_str(&format!(
        "Termination: {} after {} plies\n",
        report.termination.label(),
        report.plies_completed
    ));
    s.push_str(&format!("Positions visited: {}\n", report.positions_visited));
    s.push_str(&format!(
        "Failed evaluations: {}  Abandoned lines: {}\n",
        report.failed_evaluations, report.abandoned_lines
    ));
    if report.candidates.is_empty() {
        s.push_str("No novelties found.\n");
    }
    for (i, c) in report.candidates.iter().take(SUMMARY_LINES).enumerate() {
        let san = san_line(root, &c.moves);
        s.push_str(&format!(
            "{:>2}. {:<48} score {:>7.1}  eval {:+6.0}cp  post {}\n",
            i + 1,
            san,
            c.score,
            c.eval_cp,
            c.post_games
        ));
    }
    s.push_str(&format!("Output: {} ({} games)\n", out.display(), written));
    s.push_str("===============================\n");
    s
}

fn san_line(root: &Position, moves: &[String]) -> String {
    let mut pos = root.clone();
    let mut out = Vec::with_capacity(moves.len());
    for uci in moves {
        let san = pos.san(uci).unwrap_or_else(|_| uci.clone());
        match pos.play_uci(uci) {
            Ok(next) => pos = next,
            Err(_) => {
                out.push(uci.clone());
                break;
            }
        }
        out.push(san);
    }
    out.join(" ")
}

fn cache_info(path: &Path) -> Result<()> {
    let cache = StatsCache::open(path)
        .with_context(|| format!("failed to open cache {}", path.display()))?;
    let counts = cache.backend_counts()?;
    println!("Cache: {}", path.display());
    if counts.is_empty() {
        println!("  (empty)");
    }
    for (backend, rows) in counts {
        println!("  {backend:<48} {rows:>8}");
    }
    Ok(())
}
