//! Lichess opening explorer への HTTP 問い合わせ

use std::sync::Mutex;
use std::time::{Duration, Instant};

use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::StatusCode;

use crate::error::FetchError;

use super::client::StatsSource;
use super::{PositionStats, StatFilters};

pub const DEFAULT_BASE_URL: &str = "https://explorer.lichess.ovh";
pub const TOKEN_ENV: &str = "LICHESS_TOKEN";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(20);
const MIN_INTERVAL: Duration = Duration::from_millis(500);
/// 既定では上位 12 手しか返らない。合法手の最大数まで要求し、載っていない手を 0 局として扱えるようにする。
const MOVES_PER_QUERY: u32 = 218;

pub struct LichessExplorer {
    client: Client,
    base_url: String,
    token: Option<String>,
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl LichessExplorer {
    /// `LICHESS_TOKEN` が設定されていれば Bearer 認証を付ける。
    pub fn from_env() -> Result<Self, FetchError> {
        let token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.trim().is_empty());
        Self::new(DEFAULT_BASE_URL, token)
    }

    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(concat!("rsecond/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Permanent(format!("http client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            min_interval: MIN_INTERVAL,
            last_request: Mutex::new(None),
        })
    }

    pub fn with_min_interval(mut self, interval: Duration) -> Self {
        self.min_interval = interval;
        self
    }

    fn endpoint(&self, fen: &str, filters: &StatFilters) -> (String, Vec<(&'static str, String)>) {
        match filters {
            StatFilters::Masters => (
                format!("{}/masters", self.base_url),
                vec![
                    ("fen", fen.to_string()),
                    ("moves", MOVES_PER_QUERY.to_string()),
                ],
            ),
            StatFilters::Player {
                username,
                color,
                speeds,
            } => (
                format!("{}/player", self.base_url),
                vec![
                    ("player", username.clone()),
                    ("color", color.label().to_string()),
                    ("speeds", speeds.clone()),
                    ("recentGames", "0".to_string()),
                    ("moves", MOVES_PER_QUERY.to_string()),
                    ("fen", fen.to_string()),
                ],
            ),
        }
    }

    /// 直前のリクエストから `min_interval` 空ける。
    fn throttle(&self) {
        let mut last = self.last_request.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                std::thread::sleep(self.min_interval - elapsed);
            }
        }
        *last = Some(Instant::now());
    }
}

impl StatsSource for LichessExplorer {
    fn fetch(&self, fen: &str, filters: &StatFilters) -> Result<PositionStats, FetchError> {
        let (url, query) = self.endpoint(fen, filters);
        self.throttle();
        let mut req = self
            .client
            .get(&url)
            .query(&query)
            .header(ACCEPT, HeaderValue::from_static("application/json"));
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        let res = req.send().map_err(|e| {
            if e.is_timeout() || e.is_connect() || e.is_request() {
                FetchError::Transient(format!("GET {url}: {e}"))
            } else {
                FetchError::Permanent(format!("GET {url}: {e}"))
            }
        })?;
        let status = res.status();
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }
        let text = res
            .text()
            .map_err(|e| FetchError::Transient(format!("read body {url}: {e}")))?;
        parse_payload(&text)
    }
}

fn classify_status(status: StatusCode, url: &str) -> FetchError {
    let msg = format!("HTTP {status} for {url}");
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        FetchError::Transient(msg)
    } else {
        FetchError::Permanent(msg)
    }
}

/// player エンドポイントは NDJSON で途中経過を流すので、最後の完全な行を使う。
pub fn parse_payload(text: &str) -> Result<PositionStats, FetchError> {
    let trimmed = text.trim();
    if let Ok(stats) = serde_json::from_str::<PositionStats>(trimmed) {
        return Ok(stats);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .find_map(|l| serde_json::from_str::<PositionStats>(l).ok())
        .ok_or_else(|| FetchError::Permanent("malformed explorer response".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::position::Side;

    #[test]
    fn status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, "u"),
            FetchError::Transient(_)
        ));
        assert!(matches!(classify_status(StatusCode::BAD_GATEWAY, "u"), FetchError::Transient(_)));
        assert!(matches!(classify_status(StatusCode::NOT_FOUND, "u"), FetchError::Permanent(_)));
    }

    #[test]
    fn parses_single_document_and_ndjson() {
        let single = r#"{"white":1,"draws":2,"black":3,"moves":[]}"#;
        assert_eq!(parse_payload(single).unwrap().total(), 6);

        let stream = "{\"white\":1,\"draws\":0,\"black\":0,\"moves\":[]}\n\
                      {\"white\":5,\"draws\":0,\"black\":1,\"moves\":[]}\n";
        assert_eq!(parse_payload(stream).unwrap().total(), 6);

        assert!(matches!(parse_payload("<html>"), Err(FetchError::Permanent(_))));
    }

    #[test]
    fn player_query_carries_filters() {
        let explorer = LichessExplorer::new("http://localhost/", None).unwrap();
        let (url, query) = explorer.endpoint("fen", &StatFilters::player("bob", Side::Black, "blitz"));
        assert_eq!(url, "http://localhost/player");
        assert!(query.contains(&("color", "black".to_string())));
        assert!(query.contains(&("speeds", "blitz".to_string())));
        assert!(query.contains(&("moves", MOVES_PER_QUERY.to_string())));
    }

    #[test]
    fn masters_query_asks_for_every_move() {
        let explorer = LichessExplorer::new("http://localhost", None).unwrap();
        let (url, query) = explorer.endpoint("8/8/8/8/8/8/8/K6k w - - 0 1", &StatFilters::Masters);
        assert_eq!(url, "http://localhost/masters");
        assert_eq!(
            query,
            vec![
                ("fen", "8/8/8/8/8/8/8/K6k w - - 0 1".to_string()),
                ("moves", "218".to_string()),
            ]
        );
    }
}
