//! rsecond: 序盤の新手探索
//!
//! 過去の対局数統計と評価エンジンを組み合わせ、強くてほとんど指されていない手を
//! ビームサーチで探して注釈付き PGN に書き出す。

pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod io;
pub mod position;
pub mod retry;
pub mod score;
pub mod search;
pub mod stats;

pub use config::{CompanionConfig, RunConfig, SearchConfig};
pub use error::{ConfigError, EngineError, FetchError};
pub use position::{Position, Side};
pub use retry::RetryPolicy;
pub use search::{Candidate, Coordinator, SearchReport, Termination};
