//! The evolution loop.
//!
//! One cycle walks `SELECT_PARENT -> PROPOSE -> APPLY -> EVALUATE -> COMMIT`.
//! Nothing is written to the archive before COMMIT, so a cycle that fails or
//! is cancelled earlier leaves no trace. Archive calls run on the blocking
//! pool and no lock is held across a proposal or evaluation call.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures_util::stream::{self, StreamExt};
use serde_json::json;

use crate::archive::{Archive, Program, ProgramId};
use crate::blocks;
use crate::config::Config;
use crate::error::{ArchiveError, EvolveError, ExternalError};
use crate::external::retry::{retry_external, RetryConfig};
use crate::external::{Evaluator, ProposalRequest, ProposalSource, TargetBlock};
use crate::logging::{
    log, log_abort, log_commit, log_cycle_state, log_malformed_patch, log_patch_applied, obj,
    v_num, v_str, Domain, Level,
};
use crate::patch::{self, BlockFit, PatchDescriptor, RawPatch};
use crate::selection::{select_parent, SelectionPolicy};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Metric the hall of fame and parent selection rank by.
    pub metric: String,
    pub selection: SelectionPolicy,
    pub target_block: Option<String>,
    pub block_fit: BlockFit,
    pub retry: RetryConfig,
    pub concurrency: usize,
    pub max_consecutive_aborts: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            metric: "calmar".to_string(),
            selection: SelectionPolicy::HallOfFame { k: 5 },
            target_block: None,
            block_fit: BlockFit::Verbatim,
            retry: RetryConfig::default(),
            concurrency: 1,
            max_consecutive_aborts: 20,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            metric: cfg.hof_metric.clone(),
            selection: cfg.selection,
            target_block: cfg.target_block.clone(),
            block_fit: cfg.block_fit,
            retry: cfg.retry(),
            concurrency: cfg.concurrency.max(1),
            max_consecutive_aborts: cfg.max_consecutive_aborts,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    SelectParent,
    Propose,
    Apply,
    Evaluate,
    Commit,
    Aborted,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::SelectParent => "select_parent",
            CycleState::Propose => "propose",
            CycleState::Apply => "apply",
            CycleState::Evaluate => "evaluate",
            CycleState::Commit => "commit",
            CycleState::Aborted => "aborted",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    Committed {
        parent_id: ProgramId,
        child_id: ProgramId,
        scores: BTreeMap<String, f64>,
    },
    /// Discarded at `stage`; the archive was not touched.
    Aborted {
        parent_id: ProgramId,
        stage: CycleState,
        error: ExternalError,
    },
}

impl CycleOutcome {
    pub fn is_committed(&self) -> bool {
        matches!(self, CycleOutcome::Committed { .. })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub committed: u64,
    pub aborted: u64,
    /// Stopped after too many aborts in a row.
    pub halted: bool,
    /// Stopped by the shutdown signal.
    pub cancelled: bool,
    pub best: Option<(ProgramId, f64)>,
}

pub struct Orchestrator {
    archive: Arc<Archive>,
    proposer: Arc<dyn ProposalSource>,
    evaluator: Arc<dyn Evaluator>,
    config: OrchestratorConfig,
    next_cycle: AtomicU64,
}

impl Orchestrator {
    pub fn new(
        archive: Arc<Archive>,
        proposer: Arc<dyn ProposalSource>,
        evaluator: Arc<dyn Evaluator>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            archive,
            proposer,
            evaluator,
            config,
            next_cycle: AtomicU64::new(1),
        }
    }

    pub fn archive(&self) -> &Arc<Archive> {
        &self.archive
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    async fn with_archive<T, F>(&self, f: F) -> Result<T, EvolveError>
    where
        T: Send + 'static,
        F: FnOnce(&Archive) -> Result<T, ArchiveError> + Send + 'static,
    {
        let archive = Arc::clone(&self.archive);
        let result = tokio::task::spawn_blocking(move || f(&archive)).await?;
        Ok(result?)
    }

    /// Store a root program and evaluate it.
    ///
    /// The root is kept even when evaluation fails; it is then unranked but
    /// can still be selected as a parent.
    pub async fn seed(&self, source_text: &str) -> Result<ProgramId, EvolveError> {
        let text = source_text.to_string();
        let root = self.with_archive(move |a| a.insert(&text, None)).await?;
        log(
            Level::Info,
            Domain::Evolve,
            "seed",
            obj(&[("program_id", json!(root.0)), ("blocks", json!(blocks::block_ids(source_text)))]),
        );

        let evaluator = Arc::clone(&self.evaluator);
        match retry_external(&self.config.retry, "evaluate", || evaluator.evaluate(source_text)).await {
            Ok(evaluation) => {
                self.with_archive(move |a| a.record_evaluation_with_aux(root, &evaluation.scores, &evaluation.aux))
                    .await?;
            }
            Err(err) => log(
                Level::Warn,
                Domain::Evaluate,
                "seed_unranked",
                obj(&[("program_id", json!(root.0)), ("kind", v_str(err.kind())), ("msg", v_str(&err.to_string()))]),
            ),
        }
        Ok(root)
    }

    fn proposal_request(&self, parent: &Program) -> ProposalRequest {
        let target_block = self.config.target_block.as_deref().and_then(|id| {
            blocks::find_block(&parent.source_text, id).map(|block| TargetBlock {
                id: block.id,
                interior: block.interior,
            })
        });
        ProposalRequest {
            parent_id: parent.id,
            parent_text: parent.source_text.clone(),
            block_ids: blocks::block_ids(&parent.source_text),
            target_block,
            instructions: format!(
                "Propose one modification to this strategy that improves its `{}` score.",
                self.config.metric
            ),
        }
    }

    fn apply(&self, cycle_id: u64, parent: &Program, raw: RawPatch) -> String {
        match PatchDescriptor::try_from(raw) {
            Ok(descriptor) => {
                let child = patch::apply_with(&parent.source_text, &descriptor, self.config.block_fit);
                log_patch_applied(
                    cycle_id,
                    descriptor.shape(),
                    child != parent.source_text,
                    parent.source_text.len(),
                    child.len(),
                );
                child
            }
            // a malformed proposal yields an unchanged child
            Err(err) => {
                log_malformed_patch(cycle_id, &err.to_string());
                parent.source_text.clone()
            }
        }
    }

    fn abort(&self, cycle_id: u64, parent_id: ProgramId, stage: CycleState, error: ExternalError) -> CycleOutcome {
        log_abort(cycle_id, parent_id.0, stage.as_str(), error.kind(), &error.to_string());
        CycleOutcome::Aborted { parent_id, stage, error }
    }

    /// Run one cycle to COMMIT or ABORTED.
    ///
    /// External failures abort the cycle and come back as `Ok(Aborted)`.
    /// `Err` means the archive itself failed or holds nothing to evolve.
    pub async fn run_cycle(&self) -> Result<CycleOutcome, EvolveError> {
        let cycle_id = self.next_cycle.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();

        log_cycle_state(cycle_id, CycleState::SelectParent.as_str(), None);
        let metric = self.config.metric.clone();
        let policy = self.config.selection;
        let parent = self
            .with_archive(move |a| {
                let mut rng = rand::thread_rng();
                match select_parent(a, policy, &metric, &mut rng)? {
                    Some(id) => a.get(id).map(Some),
                    None => Ok(None),
                }
            })
            .await?
            .ok_or(EvolveError::EmptyArchive)?;

        log_cycle_state(cycle_id, CycleState::Propose.as_str(), Some(parent.id.0));
        let request = self.proposal_request(&parent);
        let proposer = Arc::clone(&self.proposer);
        let raw = match retry_external(&self.config.retry, "propose", || proposer.propose(&request)).await {
            Ok(raw) => raw,
            Err(err) => return Ok(self.abort(cycle_id, parent.id, CycleState::Propose, err)),
        };

        log_cycle_state(cycle_id, CycleState::Apply.as_str(), Some(parent.id.0));
        let child_text = self.apply(cycle_id, &parent, raw);

        log_cycle_state(cycle_id, CycleState::Evaluate.as_str(), Some(parent.id.0));
        let evaluator = Arc::clone(&self.evaluator);
        let evaluation = match retry_external(&self.config.retry, "evaluate", || evaluator.evaluate(&child_text)).await {
            Ok(evaluation) => evaluation,
            Err(err) => return Ok(self.abort(cycle_id, parent.id, CycleState::Evaluate, err)),
        };

        log_cycle_state(cycle_id, CycleState::Commit.as_str(), Some(parent.id.0));
        let parent_id = parent.id;
        // insert and record run inside one blocking task, so dropping this
        // future cannot separate them
        let (child_id, record) = self
            .with_archive(move |a| {
                let child_id = a.insert(&child_text, Some(parent_id))?;
                let record = a.record_evaluation_with_aux(child_id, &evaluation.scores, &evaluation.aux)?;
                Ok((child_id, record))
            })
            .await?;

        let metrics: Vec<(&str, f64)> = record.scores.iter().map(|(k, v)| (k.as_str(), *v)).collect();
        log_commit(
            cycle_id,
            parent_id.0,
            child_id.0,
            &metrics,
            started.elapsed().as_secs_f64() * 1000.0,
        );
        Ok(CycleOutcome::Committed {
            parent_id,
            child_id,
            scores: record.scores,
        })
    }

    /// Run `cycles` cycles, up to `concurrency` at a time.
    pub async fn run(&self, cycles: usize) -> Result<RunSummary, EvolveError> {
        self.run_until(cycles, std::future::pending::<()>()).await
    }

    /// Like [`run`](Self::run), but stops as soon as `shutdown` resolves.
    /// In-flight cycles are dropped before COMMIT and leave nothing behind.
    pub async fn run_until<S>(&self, cycles: usize, shutdown: S) -> Result<RunSummary, EvolveError>
    where
        S: Future<Output = ()>,
    {
        let mut summary = RunSummary::default();
        let mut consecutive_aborts = 0u32;
        let mut pending = stream::iter(0..cycles)
            .map(|_| self.run_cycle())
            .buffer_unordered(self.config.concurrency.max(1));
        tokio::pin!(shutdown);

        loop {
            let next = tokio::select! {
                biased;
                _ = &mut shutdown => {
                    summary.cancelled = true;
                    log(Level::Warn, Domain::Evolve, "run_cancelled", obj(&[]));
                    break;
                }
                next = pending.next() => next,
            };
            let Some(outcome) = next else {
                break;
            };
            match outcome? {
                CycleOutcome::Committed { .. } => {
                    summary.committed += 1;
                    consecutive_aborts = 0;
                }
                CycleOutcome::Aborted { .. } => {
                    summary.aborted += 1;
                    consecutive_aborts += 1;
                    if self.config.max_consecutive_aborts > 0
                        && consecutive_aborts >= self.config.max_consecutive_aborts
                    {
                        summary.halted = true;
                        log(
                            Level::Error,
                            Domain::Evolve,
                            "run_halted",
                            obj(&[("consecutive_aborts", json!(consecutive_aborts))]),
                        );
                        break;
                    }
                }
            }
        }
        drop(pending);

        let metric = self.config.metric.clone();
        let best = self.with_archive(move |a| a.top(&metric, 1)).await?;
        summary.best = best.first().map(|r| (r.program.id, r.score));

        log(
            Level::Info,
            Domain::Evolve,
            "run_summary",
            obj(&[
                ("committed", json!(summary.committed)),
                ("aborted", json!(summary.aborted)),
                ("halted", json!(summary.halted)),
                ("cancelled", json!(summary.cancelled)),
                ("metric", v_str(&self.config.metric)),
                ("best_score", summary.best.map(|(_, s)| v_num(s)).unwrap_or(serde_json::Value::Null)),
            ]),
        );
        Ok(summary)
    }
}
