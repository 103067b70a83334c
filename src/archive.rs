//! Durable program archive on SQLite.
//!
//! Every evaluated program is stored with its lineage and every evaluation
//! result is appended, never overwritten. The hall of fame is derived on
//! query from the latest score each program holds for a metric.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::ArchiveError;
use crate::logging::{log, obj, v_str, Domain, Level};

/// Idle connections kept for reuse between calls.
const MAX_IDLE_CONNECTIONS: usize = 8;

const SCHEMA: &str = "BEGIN;
CREATE TABLE IF NOT EXISTS programs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    parent_id INTEGER REFERENCES programs(id),
    generation INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    source_text TEXT NOT NULL,
    text_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS evaluation_records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    program_id INTEGER NOT NULL REFERENCES programs(id),
    recorded_at INTEGER NOT NULL,
    aux TEXT NOT NULL DEFAULT 'null'
);
CREATE TABLE IF NOT EXISTS evaluations (
    record_id INTEGER NOT NULL REFERENCES evaluation_records(id),
    program_id INTEGER NOT NULL REFERENCES programs(id),
    metric_name TEXT NOT NULL,
    score REAL NOT NULL,
    recorded_at INTEGER NOT NULL,
    PRIMARY KEY (record_id, metric_name)
);
CREATE INDEX IF NOT EXISTS idx_programs_parent ON programs(parent_id);
CREATE INDEX IF NOT EXISTS idx_evaluations_metric ON evaluations(metric_name, program_id, record_id);
COMMIT;";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProgramId(pub i64);

impl fmt::Display for ProgramId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProgramId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ProgramId)
    }
}

/// An immutable unit of evolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Program {
    pub id: ProgramId,
    pub parent_id: Option<ProgramId>,
    /// Depth from the nearest root; roots are generation 0.
    pub generation: u32,
    /// Insertion time, epoch milliseconds.
    pub created_at: i64,
    pub source_text: String,
    /// SHA-256 of `source_text`, hex encoded.
    pub text_hash: String,
}

impl Program {
    /// Leading 12 characters of the content hash, or all of it when shorter.
    pub fn short_hash(&self) -> &str {
        self.text_hash.get(..12).unwrap_or(&self.text_hash)
    }
}

/// One evaluation of one program. A program may hold several.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvaluationRecord {
    pub id: i64,
    pub program_id: ProgramId,
    pub scores: BTreeMap<String, f64>,
    pub aux: Value,
    pub recorded_at: i64,
}

/// A hall-of-fame entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ranked {
    pub program: Program,
    pub score: f64,
}

pub fn text_hash(source_text: &str) -> String {
    hex::encode(Sha256::digest(source_text.as_bytes()))
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn program_from_row(row: &Row<'_>) -> rusqlite::Result<Program> {
    Ok(Program {
        id: ProgramId(row.get(0)?),
        parent_id: row.get::<_, Option<i64>>(1)?.map(ProgramId),
        generation: row.get(2)?,
        created_at: row.get(3)?,
        source_text: row.get(4)?,
        text_hash: row.get(5)?,
    })
}

const PROGRAM_COLUMNS: &str = "id, parent_id, generation, created_at, source_text, text_hash";

fn limit_param(k: usize) -> i64 {
    i64::try_from(k).unwrap_or(i64::MAX)
}

/// The archive. Cheap to share behind an `Arc`; each call checks out its
/// own connection, so callers never serialize on a process-wide lock.
pub struct Archive {
    path: PathBuf,
    idle: Mutex<Vec<Connection>>,
}

impl Archive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Self::connect(&path)?;
        conn.execute_batch(SCHEMA)?;
        log(
            Level::Info,
            Domain::Archive,
            "archive_open",
            obj(&[("path", v_str(&path.to_string_lossy()))]),
        );
        Ok(Self {
            path,
            idle: Mutex::new(vec![conn]),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(path: &Path) -> Result<Connection, ArchiveError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(30))?;
        // journal_mode answers with the mode now in effect
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch(
            "PRAGMA synchronous = FULL;
             PRAGMA foreign_keys = ON;",
        )?;
        Ok(conn)
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, ArchiveError>,
    ) -> Result<T, ArchiveError> {
        let pooled = self.idle.lock().ok().and_then(|mut idle| idle.pop());
        let mut conn = match pooled {
            Some(conn) => conn,
            None => Self::connect(&self.path)?,
        };
        let out = f(&mut conn);
        if let Ok(mut idle) = self.idle.lock() {
            if idle.len() < MAX_IDLE_CONNECTIONS {
                idle.push(conn);
            }
        }
        out
    }

    /// Store a new program. Its generation is derived from the parent.
    pub fn insert(
        &self,
        source_text: &str,
        parent_id: Option<ProgramId>,
    ) -> Result<ProgramId, ArchiveError> {
        let hash = text_hash(source_text);
        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let generation: i64 = match parent_id {
                Some(pid) => {
                    let parent_generation: Option<i64> = tx
                        .query_row(
                            "SELECT generation FROM programs WHERE id = ?1",
                            params![pid.0],
                            |row| row.get(0),
                        )
                        .optional()?;
                    parent_generation.ok_or(ArchiveError::NotFound(pid))? + 1
                }
                None => 0,
            };
            tx.execute(
                "INSERT INTO programs (parent_id, generation, created_at, source_text, text_hash)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![parent_id.map(|p| p.0), generation, now_ms(), source_text, hash],
            )?;
            let id = ProgramId(tx.last_insert_rowid());
            tx.commit()?;
            Ok(id)
        })
    }

    pub fn get(&self, id: ProgramId) -> Result<Program, ArchiveError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {PROGRAM_COLUMNS} FROM programs WHERE id = ?1"),
                params![id.0],
                program_from_row,
            )
            .optional()?
            .ok_or(ArchiveError::NotFound(id))
        })
    }

    pub fn record_evaluation(
        &self,
        program_id: ProgramId,
        scores: &BTreeMap<String, f64>,
    ) -> Result<EvaluationRecord, ArchiveError> {
        self.record_evaluation_with_aux(program_id, scores, &Value::Null)
    }

    /// Append an evaluation record. Earlier records for the same program are
    /// kept. Non-finite scores cannot be ranked and are left out.
    pub fn record_evaluation_with_aux(
        &self,
        program_id: ProgramId,
        scores: &BTreeMap<String, f64>,
        aux: &Value,
    ) -> Result<EvaluationRecord, ArchiveError> {
        let (finite, dropped): (BTreeMap<String, f64>, BTreeMap<String, f64>) = scores
            .iter()
            .map(|(name, score)| (name.clone(), *score))
            .partition(|(_, score)| score.is_finite());
        if !dropped.is_empty() {
            log(
                Level::Warn,
                Domain::Archive,
                "non_finite_scores_dropped",
                obj(&[
                    ("program_id", serde_json::json!(program_id.0)),
                    ("metrics", serde_json::json!(dropped.keys().collect::<Vec<_>>())),
                ]),
            );
        }
        let aux_text = serde_json::to_string(aux)?;
        let recorded_at = now_ms();

        self.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM programs WHERE id = ?1",
                    params![program_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(ArchiveError::NotFound(program_id));
            }
            tx.execute(
                "INSERT INTO evaluation_records (program_id, recorded_at, aux) VALUES (?1, ?2, ?3)",
                params![program_id.0, recorded_at, aux_text],
            )?;
            let record_id = tx.last_insert_rowid();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO evaluations (record_id, program_id, metric_name, score, recorded_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for (name, score) in &finite {
                    stmt.execute(params![record_id, program_id.0, name, score, recorded_at])?;
                }
            }
            tx.commit()?;
            Ok(EvaluationRecord {
                id: record_id,
                program_id,
                scores: finite,
                aux: aux.clone(),
                recorded_at,
            })
        })
    }

    /// Evaluation history of one program, oldest first.
    pub fn evaluations(&self, program_id: ProgramId) -> Result<Vec<EvaluationRecord>, ArchiveError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT id FROM programs WHERE id = ?1",
                    params![program_id.0],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(ArchiveError::NotFound(program_id));
            }

            let mut records: Vec<EvaluationRecord> = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT r.id, r.recorded_at, r.aux, e.metric_name, e.score
                     FROM evaluation_records r
                     LEFT JOIN evaluations e ON e.record_id = r.id
                     WHERE r.program_id = ?1
                     ORDER BY r.id, e.metric_name",
                )?;
                let mut rows = stmt.query(params![program_id.0])?;
                while let Some(row) = rows.next()? {
                    let record_id: i64 = row.get(0)?;
                    if records.last().map(|r| r.id) != Some(record_id) {
                        let aux_text: String = row.get(2)?;
                        records.push(EvaluationRecord {
                            id: record_id,
                            program_id,
                            scores: BTreeMap::new(),
                            aux: serde_json::from_str(&aux_text)?,
                            recorded_at: row.get(1)?,
                        });
                    }
                    let metric: Option<String> = row.get(3)?;
                    let score: Option<f64> = row.get(4)?;
                    if let (Some(metric), Some(score), Some(record)) = (metric, score, records.last_mut()) {
                        record.scores.insert(metric, score);
                    }
                }
            }
            tx.commit()?;
            Ok(records)
        })
    }

    /// Hall of fame: the best `k` programs by their latest `metric` score.
    ///
    /// Ties go to the lower generation, then the earlier insertion. Programs
    /// without a score for `metric` are not ranked.
    pub fn top(&self, metric: &str, k: usize) -> Result<Vec<Ranked>, ArchiveError> {
        if k == 0 {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.id, p.parent_id, p.generation, p.created_at, p.source_text, p.text_hash, e.score
                 FROM programs p
                 JOIN evaluations e ON e.program_id = p.id
                 WHERE e.metric_name = ?1
                   AND e.record_id = (
                       SELECT MAX(e2.record_id) FROM evaluations e2
                       WHERE e2.program_id = p.id AND e2.metric_name = ?1
                   )
                 ORDER BY e.score DESC, p.generation ASC, p.created_at ASC, p.id ASC
                 LIMIT ?2",
            )?;
            let ranked = stmt
                .query_map(params![metric, limit_param(k)], |row| {
                    Ok(Ranked {
                        program: program_from_row(row)?,
                        score: row.get(6)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ranked)
        })
    }

    /// Ancestry of `id`, starting with the program itself and ending at its root.
    pub fn lineage(&self, id: ProgramId) -> Result<Vec<Program>, ArchiveError> {
        let chain = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "WITH RECURSIVE chain(id, depth) AS (
                     SELECT id, 0 FROM programs WHERE id = ?1
                     UNION ALL
                     SELECT p.parent_id, c.depth + 1 FROM programs p
                     JOIN chain c ON p.id = c.id
                     WHERE p.parent_id IS NOT NULL
                 )
                 SELECT p.id, p.parent_id, p.generation, p.created_at, p.source_text, p.text_hash
                 FROM chain c JOIN programs p ON p.id = c.id
                 ORDER BY c.depth",
            )?;
            let programs = stmt
                .query_map(params![id.0], program_from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(programs)
        })?;
        if chain.is_empty() {
            return Err(ArchiveError::NotFound(id));
        }
        Ok(chain)
    }

    pub fn count(&self) -> Result<u64, ArchiveError> {
        self.with_conn(|conn| {
            let n: i64 = conn.query_row("SELECT COUNT(*) FROM programs", [], |row| row.get(0))?;
            Ok(n as u64)
        })
    }

    /// All program ids in insertion order.
    pub fn ids(&self) -> Result<Vec<ProgramId>, ArchiveError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id FROM programs ORDER BY id")?;
            let ids = stmt
                .query_map([], |row| row.get(0).map(ProgramId))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })
    }
}
