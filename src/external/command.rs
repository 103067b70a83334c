use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::Config;
use crate::error::ExternalError;
use crate::external::{Evaluation, Evaluator};
use crate::logging::{log, obj, v_str, Domain, Level};

/// Evaluator that runs an external backtest command.
///
/// The program text is written to the command's stdin. The command prints a
/// JSON object on stdout, either `{"sharpe": 1.2, ...}` or
/// `{"metrics": {...}, "aux": ...}`. Log lines before the JSON are allowed.
#[derive(Debug, Clone)]
pub struct CommandEvaluator {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    timeout: Duration,
}

impl CommandEvaluator {
    pub fn new(command_line: &str, timeout: Duration) -> Result<Self, ExternalError> {
        let mut parts = command_line.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| ExternalError::Permanent("evaluator command is empty".to_string()))?;
        Ok(Self {
            program,
            args: parts.collect(),
            envs: Vec::new(),
            timeout,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self, ExternalError> {
        Ok(Self::new(&cfg.eval_cmd, Duration::from_secs(cfg.eval_timeout_secs))?
            .env("DEFAULT_SYMBOLS", &cfg.default_symbols.join(","))
            .env("START_DATE", &cfg.start_date)
            .env("HOF_METRIC", &cfg.hof_metric))
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.envs.push((key.to_string(), value.to_string()));
        self
    }
}

#[async_trait]
impl Evaluator for CommandEvaluator {
    async fn evaluate(&self, source_text: &str) -> Result<Evaluation, ExternalError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExternalError::Permanent(format!("failed to start {}: {}", self.program, e)))?;

        // feed stdin concurrently so a chatty child cannot deadlock on a full pipe
        if let Some(mut stdin) = child.stdin.take() {
            let text = source_text.to_string();
            tokio::spawn(async move {
                let _ = stdin.write_all(text.as_bytes()).await;
                let _ = stdin.shutdown().await;
            });
        }

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ExternalError::Transient(format!("evaluator io: {}", e)))?,
            Err(_) => {
                return Err(ExternalError::Transient(format!(
                    "evaluator timed out after {}s",
                    self.timeout.as_secs()
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = tail_chars(stderr.trim_end(), 500);
            log(
                Level::Warn,
                Domain::Evaluate,
                "evaluator_failed",
                obj(&[("status", v_str(&output.status.to_string())), ("stderr", v_str(&tail))]),
            );
            return Err(ExternalError::Permanent(format!("evaluator exited with {}: {}", output.status, tail)));
        }

        parse_metrics(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Read an evaluation from evaluator stdout.
///
/// The whole output is tried as JSON first, then the last line that parses
/// as a JSON object.
pub fn parse_metrics(stdout: &str) -> Result<Evaluation, ExternalError> {
    let object = serde_json::from_str::<Value>(stdout.trim())
        .ok()
        .and_then(|v| v.as_object().cloned())
        .or_else(|| {
            stdout.lines().rev().find_map(|line| {
                serde_json::from_str::<Value>(line.trim())
                    .ok()
                    .and_then(|v| v.as_object().cloned())
            })
        })
        .ok_or_else(|| ExternalError::Permanent("evaluator printed no JSON object".to_string()))?;

    let evaluation = match object.get("metrics").and_then(Value::as_object) {
        Some(metrics) => Evaluation {
            scores: numeric_fields(metrics).0,
            aux: object.get("aux").cloned().unwrap_or(Value::Null),
        },
        None => {
            let (scores, rest) = numeric_fields(&object);
            Evaluation {
                scores,
                aux: if rest.is_empty() { Value::Null } else { Value::Object(rest) },
            }
        }
    };
    if evaluation.scores.is_empty() {
        return Err(ExternalError::Permanent("evaluator reported no numeric metrics".to_string()));
    }
    Ok(evaluation)
}

fn tail_chars(text: &str, n: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    chars[chars.len().saturating_sub(n)..].iter().collect()
}

fn numeric_fields(object: &Map<String, Value>) -> (BTreeMap<String, f64>, Map<String, Value>) {
    let mut scores = BTreeMap::new();
    let mut rest = Map::new();
    for (key, value) in object {
        match value.as_f64() {
            Some(score) => {
                scores.insert(key.clone(), score);
            }
            None => {
                rest.insert(key.clone(), value.clone());
            }
        }
    }
    (scores, rest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_flat_metrics() {
        let eval = parse_metrics("{\"calmar\": 1.5, \"sharpe\": 0.8, \"trades\": 12, \"note\": \"ok\"}").unwrap();
        assert_eq!(eval.scores.len(), 3);
        assert_eq!(eval.scores["calmar"], 1.5);
        assert_eq!(eval.aux["note"], "ok");
    }

    #[test]
    fn test_parse_nested_metrics_after_log_lines() {
        let out = "loading SPY\nrunning backtest\n{\"metrics\": {\"calmar\": 0.3}, \"aux\": {\"equity\": [1, 2]}}\n";
        let eval = parse_metrics(out).unwrap();
        assert_eq!(eval.scores["calmar"], 0.3);
        assert_eq!(eval.aux["equity"][1], 2);
    }

    #[test]
    fn test_parse_rejects_missing_or_empty_output() {
        assert!(matches!(parse_metrics(""), Err(ExternalError::Permanent(_))));
        assert!(matches!(parse_metrics("Traceback: boom"), Err(ExternalError::Permanent(_))));
        assert!(matches!(parse_metrics("{\"status\": \"ok\"}"), Err(ExternalError::Permanent(_))));
    }

    #[test]
    fn test_tail_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
    }

    #[test]
    fn test_empty_command_is_rejected() {
        assert!(CommandEvaluator::new("   ", Duration::from_secs(1)).is_err());
        let eval = CommandEvaluator::new("python -m bt --fast", Duration::from_secs(1)).unwrap();
        assert_eq!(eval.program, "python");
        assert_eq!(eval.args, vec!["-m", "bt", "--fast"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_runs_command_over_stdin() {
        // echoes a fixed score once stdin is drained
        let eval = CommandEvaluator {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "cat >/dev/null; echo '{\"calmar\": 2.5}'".to_string()],
            envs: Vec::new(),
            timeout: Duration::from_secs(10),
        };
        let result = eval.evaluate("print('hi')\n").await.unwrap();
        assert_eq!(result.scores["calmar"], 2.5);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_permanent() {
        let eval = CommandEvaluator {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "echo boom >&2; exit 3".to_string()],
            envs: Vec::new(),
            timeout: Duration::from_secs(10),
        };
        let err = eval.evaluate("x").await.unwrap_err();
        assert!(matches!(err, ExternalError::Permanent(ref m) if m.contains("boom")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_is_transient() {
        let eval = CommandEvaluator {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "sleep 5".to_string()],
            envs: Vec::new(),
            timeout: Duration::from_millis(100),
        };
        let err = eval.evaluate("x").await.unwrap_err();
        assert!(err.is_transient());
    }
}
