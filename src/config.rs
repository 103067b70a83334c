use std::path::PathBuf;

use crate::external::retry::RetryConfig;
use crate::patch::BlockFit;
use crate::selection::SelectionPolicy;

/// Runtime configuration, read once at startup and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub openai_base_url: String,
    /// Deadline for one chat completion request, connect to last byte.
    pub openai_timeout_secs: u64,
    pub max_tokens: u32,
    pub sqlite_db: PathBuf,
    pub hof_metric: String,
    pub hof_k: usize,
    pub selection: SelectionPolicy,
    /// Block whose interior is sent along with each proposal request
    pub target_block: Option<String>,
    pub block_fit: BlockFit,
    pub eval_cmd: String,
    pub eval_timeout_secs: u64,
    pub max_tries: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
    pub concurrency: usize,
    pub max_consecutive_aborts: u32,
    pub default_symbols: Vec<String>,
    pub start_date: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let hof_k = var("HOF_K").and_then(|v| v.parse::<usize>().ok()).filter(|k| *k > 0).unwrap_or(5);
        Self {
            openai_api_key: var("OPENAI_API_KEY").filter(|k| !k.trim().is_empty()),
            openai_model: var("OPENAI_MODEL").unwrap_or_else(|| "o3-mini".to_string()),
            openai_base_url: var("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            openai_timeout_secs: var("OPENAI_TIMEOUT_SECS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(120),
            max_tokens: var("MAX_TOKENS").and_then(|v| v.parse().ok()).unwrap_or(4096),
            sqlite_db: expand_home(
                &var("SQLITE_DB").unwrap_or_else(|| "~/.pwb_alphaevolve/programs.db".to_string()),
                var("HOME"),
            ),
            hof_metric: var("HOF_METRIC").unwrap_or_else(|| "calmar".to_string()),
            hof_k,
            selection: var("SELECTION")
                .and_then(|v| SelectionPolicy::parse(&v, hof_k))
                .unwrap_or(SelectionPolicy::HallOfFame { k: hof_k }),
            target_block: var("TARGET_BLOCK").filter(|b| !b.trim().is_empty()),
            block_fit: var("BLOCK_FIT").and_then(|v| BlockFit::parse(&v)).unwrap_or_default(),
            eval_cmd: var("EVAL_CMD").unwrap_or_else(|| "python -m pwb_alphaevolve.evaluate".to_string()),
            eval_timeout_secs: var("EVAL_TIMEOUT_SECS").and_then(|v| v.parse().ok()).unwrap_or(600),
            max_tries: var("MAX_TRIES").and_then(|v| v.parse().ok()).unwrap_or(5),
            retry_base_ms: var("RETRY_BASE_MS").and_then(|v| v.parse().ok()).unwrap_or(500),
            retry_max_ms: var("RETRY_MAX_MS").and_then(|v| v.parse().ok()).unwrap_or(30_000),
            concurrency: var("CONCURRENCY")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or_else(num_cpus::get),
            max_consecutive_aborts: var("MAX_CONSECUTIVE_ABORTS").and_then(|v| v.parse().ok()).unwrap_or(20),
            default_symbols: parse_symbols(
                &var("DEFAULT_SYMBOLS").unwrap_or_else(|| "SPY,EFA,IEF,VNQ,GSG".to_string()),
            ),
            start_date: var("START_DATE").unwrap_or_else(|| "1990-01-01".to_string()),
        }
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_tries,
            base_delay_ms: self.retry_base_ms,
            max_delay_ms: self.retry_max_ms,
            ..RetryConfig::default()
        }
    }
}

/// Upper-cased, de-blanked tickers from a comma-separated list.
pub fn parse_symbols(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn expand_home(path: &str, home: Option<String>) -> PathBuf {
    match (path.strip_prefix("~/"), home) {
        (Some(rest), Some(home)) => PathBuf::from(home).join(rest),
        _ => PathBuf::from(path),
    }
}
