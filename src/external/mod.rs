//! Boundary to the collaborators the evolution loop depends on but does not
//! own: the proposal source that authors patches and the evaluator that
//! scores programs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use crate::archive::ProgramId;
use crate::error::ExternalError;
use crate::patch::RawPatch;

pub mod command;
pub mod openai;
pub mod retry;

/// The interior of the block a proposal should focus on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetBlock {
    pub id: String,
    pub interior: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProposalRequest {
    pub parent_id: ProgramId,
    pub parent_text: String,
    /// Block identifiers present in `parent_text`, in document order.
    pub block_ids: Vec<String>,
    pub target_block: Option<TargetBlock>,
    pub instructions: String,
}

/// Scores reported by an evaluator, plus whatever else it chose to attach.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub scores: BTreeMap<String, f64>,
    pub aux: Value,
}

impl Evaluation {
    pub fn from_scores<I, K>(scores: I) -> Self
    where
        I: IntoIterator<Item = (K, f64)>,
        K: Into<String>,
    {
        Self {
            scores: scores.into_iter().map(|(k, v)| (k.into(), v)).collect(),
            aux: Value::Null,
        }
    }
}

#[async_trait]
pub trait ProposalSource: Send + Sync {
    async fn propose(&self, request: &ProposalRequest) -> Result<RawPatch, ExternalError>;
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, source_text: &str) -> Result<Evaluation, ExternalError>;
}
