//! エラー型
//!
//! 設定エラーだけが呼び出し元まで伝播する。統計取得とエンジン評価のエラーは
//! 該当ラインの破棄に変換され、探索全体は止めない。

/// 探索開始前に検出される入力エラー
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// FEN / position 行として解釈できない
    #[error("invalid position: {0}")]
    InvalidPosition(String),

    /// novelty_threshold が min_book_games を超えている
    #[error(
        "novelty_threshold ({novelty_threshold}) must not exceed min_book_games ({min_book_games})"
    )]
    ContradictoryThresholds {
        novelty_threshold: u64,
        min_book_games: u64,
    },

    /// 下限を下回る数値パラメータ
    #[error("{field} must be at least {min}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: u64,
        value: u64,
    },

    #[error("depths must contain at least one positive depth")]
    EmptyDepths,

    #[error("min_eval must be a finite number")]
    NonFiniteMinEval,

    #[error("side must be 'white' or 'black', got '{0}'")]
    InvalidSide(String),

    /// 設定ファイルの構文エラー
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
}

/// 統計ソースからの取得エラー
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// タイムアウト・レート制限など、再試行で回復し得るもの
    #[error("transient fetch failure: {0}")]
    Transient(String),

    /// 4xx や不正な応答など、再試行しても変わらないもの
    #[error("fetch failed: {0}")]
    Permanent(String),
}

/// 評価エンジン関連のエラー
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to start engine: {0}")]
    Spawn(String),

    /// 応答タイムアウト・想定外の出力
    #[error("engine protocol error: {0}")]
    Protocol(String),

    /// プロセスが終了した
    #[error("engine process exited: {0}")]
    Crashed(String),

    /// 再起動できずスロットが停止している
    #[error("engine slot {slot} is unavailable")]
    Unavailable { slot: usize },

    /// 再起動後の再評価も失敗した
    #[error("evaluation failed after {attempts} attempts: {last}")]
    Failed { attempts: u32, last: String },
}
