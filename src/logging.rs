//! Structured logging for the evolution loop.
//!
//! Every record is one JSON object per line with a run id, a monotonic
//! sequence number, a level and a domain. Records go to
//! `$LOG_DIR/<run_id>/events.jsonl` (trace/debug to `trace.jsonl`) and are
//! echoed to stderr so stdout stays free for command output.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs::{create_dir_all, File};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

// =============================================================================
// Log Levels
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Trace = 0,
    Debug = 1,
    Info = 2,
    Warn = 3,
    Error = 4,
    Fatal = 5,
}

impl Level {
    pub fn from_env() -> Self {
        match std::env::var("LOG_LEVEL").as_deref() {
            Ok("trace") => Level::Trace,
            Ok("debug") => Level::Debug,
            Ok("info") => Level::Info,
            Ok("warn") => Level::Warn,
            Ok("error") => Level::Error,
            Ok("fatal") => Level::Fatal,
            _ => Level::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Trace => "trace",
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
            Level::Fatal => "fatal",
        }
    }
}

// =============================================================================
// Log Domains (categories for filtering)
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Archive,  // Inserts, evaluation records, schema
    Patch,    // Patch shape, malformed proposals, applied diffs
    Proposal, // Proposal source calls
    Evaluate, // Evaluator calls
    Evolve,   // Cycle state transitions, run summaries
    System,   // Startup, shutdown, config
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Archive => "archive",
            Domain::Patch => "patch",
            Domain::Proposal => "proposal",
            Domain::Evaluate => "evaluate",
            Domain::Evolve => "evolve",
            Domain::System => "system",
        }
    }

    pub fn is_enabled(&self) -> bool {
        // LOG_DOMAINS is a comma-separated list or "all"
        match std::env::var("LOG_DOMAINS").as_deref() {
            Ok("all") | Err(_) => true,
            Ok(domains) => domains.split(',').any(|d| d.trim() == self.as_str()),
        }
    }
}

// =============================================================================
// Run context
// =============================================================================

static LOG_SEQ: AtomicU64 = AtomicU64::new(0);
static RUN_CONTEXT: OnceLock<RunContext> = OnceLock::new();

fn next_seq() -> u64 {
    LOG_SEQ.fetch_add(1, Ordering::SeqCst)
}

#[derive(Debug)]
struct RunContext {
    run_id: String,
    events: Option<Mutex<BufWriter<File>>>,
    trace: Option<Mutex<BufWriter<File>>>,
}

fn open_log(path: PathBuf) -> Option<Mutex<BufWriter<File>>> {
    match File::create(&path) {
        Ok(file) => Some(Mutex::new(BufWriter::new(file))),
        Err(err) => {
            eprintln!("[log] failed to create {}: {}", path.display(), err);
            None
        }
    }
}

fn ensure_run_context() -> &'static RunContext {
    RUN_CONTEXT.get_or_init(|| {
        let run_id = std::env::var("RUN_ID")
            .unwrap_or_else(|_| format!("r-{}-{}", ts_epoch_ms(), process::id()));
        let base = std::env::var("LOG_DIR").unwrap_or_else(|_| "out/runs".to_string());
        let mut run_dir = PathBuf::from(base);
        run_dir.push(&run_id);
        if let Err(err) = create_dir_all(&run_dir) {
            eprintln!("[log] failed to create run dir: {}", err);
        }

        let _ = std::fs::write(
            run_dir.join("manifest.json"),
            json!({
                "run_id": run_id,
                "ts": ts_now(),
                "pid": process::id(),
                "log_dir": run_dir.to_string_lossy(),
            })
            .to_string(),
        );

        RunContext {
            events: open_log(run_dir.join("events.jsonl")),
            trace: open_log(run_dir.join("trace.jsonl")),
            run_id,
        }
    })
}

fn sanitize_fields(mut fields: Map<String, Value>) -> Map<String, Value> {
    let redacted = Value::String("[REDACTED]".to_string());
    for key in ["authorization", "Authorization", "api_key", "openai_api_key"] {
        if fields.contains_key(key) {
            fields.insert(key.to_string(), redacted.clone());
        }
    }
    fields
}

fn split_fields(mut fields: Map<String, Value>) -> (Map<String, Value>, Map<String, Value>) {
    let mut top = Map::new();
    for key in ["cycle_id", "program_id", "parent_id", "msg"] {
        if let Some(value) = fields.remove(key) {
            top.insert(key.to_string(), value);
        }
    }
    (top, fields)
}

fn write_line(writer: &Option<Mutex<BufWriter<File>>>, line: &str) {
    let Some(writer) = writer else {
        return;
    };
    if let Ok(mut w) = writer.lock() {
        let _ = writeln!(w, "{}", line);
        let _ = w.flush();
    }
}

// =============================================================================
// Core logging functions
// =============================================================================

/// RFC3339 timestamp with milliseconds
pub fn ts_now() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn ts_epoch_ms() -> u64 {
    Utc::now().timestamp_millis() as u64
}

/// Emit a structured log entry
pub fn log(level: Level, domain: Domain, event: &str, fields: Map<String, Value>) {
    if level < Level::from_env() || !domain.is_enabled() {
        return;
    }
    emit_record(level, domain.as_str(), event, fields);
}

fn emit_record(level: Level, component: &str, event: &str, fields: Map<String, Value>) {
    let ctx = ensure_run_context();
    let (mut top, data) = split_fields(sanitize_fields(fields));

    let msg = top.remove("msg").unwrap_or(Value::String(String::new()));
    let mut entry = Map::new();
    entry.insert("ts".to_string(), json!(ts_now()));
    entry.insert("run_id".to_string(), json!(ctx.run_id.clone()));
    entry.insert("seq".to_string(), json!(next_seq()));
    entry.insert("lvl".to_string(), json!(level.as_str().to_uppercase()));
    entry.insert("component".to_string(), json!(component));
    entry.insert("event".to_string(), json!(event));
    entry.insert("msg".to_string(), msg);
    for (k, v) in top {
        entry.insert(k, v);
    }
    entry.insert("data".to_string(), Value::Object(data));

    let line = Value::Object(entry).to_string();
    match level {
        Level::Trace | Level::Debug => write_line(&ctx.trace, &line),
        _ => write_line(&ctx.events, &line),
    }
    eprintln!("{}", line);
}

// =============================================================================
// Evolution helpers
// =============================================================================

pub fn log_cycle_state(cycle_id: u64, state: &str, program_id: Option<i64>) {
    log(
        Level::Debug,
        Domain::Evolve,
        "cycle_state",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("state", v_str(state)),
            ("program_id", program_id.map(|id| json!(id)).unwrap_or(Value::Null)),
        ]),
    );
}

pub fn log_patch_applied(cycle_id: u64, shape: &str, changed: bool, parent_len: usize, child_len: usize) {
    log(
        Level::Info,
        Domain::Patch,
        "patch_applied",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("shape", v_str(shape)),
            ("changed", json!(changed)),
            ("parent_bytes", json!(parent_len)),
            ("child_bytes", json!(child_len)),
        ]),
    );
}

pub fn log_malformed_patch(cycle_id: u64, reason: &str) {
    log(
        Level::Warn,
        Domain::Patch,
        "malformed_patch",
        obj(&[("cycle_id", json!(cycle_id)), ("reason", v_str(reason))]),
    );
}

pub fn log_commit(cycle_id: u64, parent_id: i64, child_id: i64, metrics: &[(&str, f64)], elapsed_ms: f64) {
    let scores: Map<String, Value> = metrics
        .iter()
        .map(|(k, v)| (k.to_string(), v_num(*v)))
        .collect();
    log(
        Level::Info,
        Domain::Evolve,
        "commit",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("parent_id", json!(parent_id)),
            ("program_id", json!(child_id)),
            ("scores", Value::Object(scores)),
            ("elapsed_ms", v_num(elapsed_ms)),
        ]),
    );
}

pub fn log_abort(cycle_id: u64, parent_id: i64, stage: &str, kind: &str, reason: &str) {
    log(
        Level::Warn,
        Domain::Evolve,
        "abort",
        obj(&[
            ("cycle_id", json!(cycle_id)),
            ("parent_id", json!(parent_id)),
            ("stage", v_str(stage)),
            ("kind", v_str(kind)),
            ("msg", v_str(reason)),
        ]),
    );
}

pub fn log_retry(operation: &str, attempt: u32, max_attempts: u32, delay_ms: u64, reason: &str) {
    log(
        Level::Warn,
        Domain::System,
        "retry",
        obj(&[
            ("operation", v_str(operation)),
            ("attempt", json!(attempt)),
            ("max_attempts", json!(max_attempts)),
            ("delay_ms", json!(delay_ms)),
            ("msg", v_str(reason)),
        ]),
    );
}

// =============================================================================
// Field helpers
// =============================================================================

pub fn obj(pairs: &[(&str, Value)]) -> Map<String, Value> {
    let mut map = Map::new();
    for (k, v) in pairs {
        map.insert((*k).to_string(), v.clone());
    }
    map
}

pub fn v_str(s: &str) -> Value {
    Value::String(s.to_string())
}

pub fn v_num(n: f64) -> Value {
    json!(n)
}
