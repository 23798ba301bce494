//! Run state schemas: evaluation records, generation summaries, and the
//! append-only run history.
//!
//! The history is the search's source of truth. Records are pushed, never
//! edited, so a finished run can be replayed and any candidate's lineage
//! reconstructed. The best-found template is always derived by scanning all
//! records - including rejected candidates - so selection pressure can never
//! lose the best result.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Did a candidate's evaluation produce a usable fitness value?
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandidateStatus {
    Ok,
    Failed { reason: String },
}

/// One excluded unit of work inside an evaluation: a (transcript, question)
/// answer that failed, or a whole transcript whose fill failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exclusion {
    pub transcript_id: String,
    /// None when the whole pairing was excluded (fill failure)
    pub question_id: Option<String>,
    pub reason: String,
}

/// Immutable evaluation result for one template. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub template_id: String,
    pub generation: usize,
    pub status: CandidateStatus,
    /// Mean divergence across transcripts; `None` when the candidate failed
    pub aggregate: Option<f64>,
    /// Standard error of the aggregate (noise floor for acceptance)
    pub std_err: f64,
    /// Pooled per-question mean divergence
    pub per_question: HashMap<String, f64>,
    /// Per-transcript aggregate divergence
    pub per_transcript: HashMap<String, f64>,
    /// Work excluded from the aggregate, with reasons
    pub excluded: Vec<Exclusion>,
    /// Oracle calls consumed by this evaluation
    pub oracle_calls: usize,
    /// Unix timestamp at completion
    pub timestamp: i64,
}

impl EvaluationRecord {
    pub fn is_ok(&self) -> bool {
        self.status == CandidateStatus::Ok
    }

    /// Record for a candidate that produced no usable pairs at all.
    pub fn failed(
        template_id: &str,
        generation: usize,
        reason: impl Into<String>,
        excluded: Vec<Exclusion>,
        oracle_calls: usize,
    ) -> Self {
        EvaluationRecord {
            template_id: template_id.to_string(),
            generation,
            status: CandidateStatus::Failed {
                reason: reason.into(),
            },
            aggregate: None,
            std_err: 0.0,
            per_question: HashMap::new(),
            per_transcript: HashMap::new(),
            excluded,
            oracle_calls,
            timestamp: now_secs(),
        }
    }
}

pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Per-generation rollup for trajectory analysis and display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationSummary {
    pub generation: usize,
    /// Candidates evaluated this generation
    pub evaluated: usize,
    /// Of which failed
    pub failed: usize,
    /// Best aggregate within this generation alone
    pub best_in_generation: Option<f64>,
    /// Best aggregate over the whole run so far (monotone non-increasing)
    pub best_so_far: Option<f64>,
    /// Oracle calls consumed so far, run-wide
    pub oracle_calls_total: usize,
    pub duration_secs: f64,
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Patience or target reached: optimization finished
    Converged,
    /// Generation or oracle-call budget hit first
    Exhausted,
    /// No candidate could be evaluated for several consecutive generations
    Failed,
}

impl std::fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunOutcome::Converged => write!(f, "converged"),
            RunOutcome::Exhausted => write!(f, "exhausted"),
            RunOutcome::Failed => write!(f, "failed"),
        }
    }
}

/// Append-only history of a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHistory {
    /// Run identifier (directory name)
    pub run_id: String,
    /// Every evaluation ever performed, in completion order
    pub records: Vec<EvaluationRecord>,
    /// One summary per completed generation
    pub generations: Vec<GenerationSummary>,
}

impl RunHistory {
    pub fn new(run_id: impl Into<String>) -> Self {
        RunHistory {
            run_id: run_id.into(),
            records: Vec::new(),
            generations: Vec::new(),
        }
    }

    /// Append an evaluation record. Records are never mutated afterwards.
    pub fn push_record(&mut self, record: EvaluationRecord) {
        self.records.push(record);
    }

    /// The best record over the entire run: argmin aggregate across all Ok
    /// records, rejected candidates included. Ties keep the earlier record.
    pub fn best_record(&self) -> Option<&EvaluationRecord> {
        self.records
            .iter()
            .filter(|r| r.is_ok())
            .filter_map(|r| r.aggregate.map(|a| (r, a)))
            .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(r, _)| r)
    }

    pub fn best_aggregate(&self) -> Option<f64> {
        self.best_record().and_then(|r| r.aggregate)
    }

    /// Latest record for a template id.
    pub fn latest_record(&self, template_id: &str) -> Option<&EvaluationRecord> {
        self.records
            .iter()
            .rev()
            .find(|r| r.template_id == template_id)
    }

    /// No improvement greater than `epsilon` across the last `patience`
    /// completed generations.
    pub fn is_plateau(&self, patience: usize, epsilon: f64) -> bool {
        if self.generations.len() <= patience {
            return false;
        }
        let n = self.generations.len();
        let then = self.generations[n - 1 - patience].best_so_far;
        let now = self.generations[n - 1].best_so_far;
        match (then, now) {
            (Some(then), Some(now)) => then - now <= epsilon,
            _ => false,
        }
    }

    /// Consecutive trailing generations in which nothing evaluated Ok.
    pub fn barren_streak(&self) -> usize {
        self.generations
            .iter()
            .rev()
            .take_while(|g| g.evaluated == g.failed)
            .count()
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = serde_json::to_string_pretty(self).context("serialize run history")?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("write history to {}", path.as_ref().display()))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read history from {}", path.as_ref().display()))?;
        serde_json::from_str(&content).context("parse run history")
    }
}
