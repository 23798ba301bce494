//! Divergence estimation between two conditioning contexts.
//!
//! ## The measurement
//!
//! For every question we hold two answer distributions: one produced with the
//! full transcript as context ("what the model believes about this
//! participant") and one produced with the filled template as context ("what
//! the compact summary lets it believe"). The per-question distance is the
//! Kullback-Leibler divergence
//!
//! ```text
//! KL(P_full || P_template) = Σᵥ p(v) · ln(p(v) / q(v))
//! ```
//!
//! with the full-transcript side as reference. The direction is deliberate:
//! we score how well the template reproduces the full model's belief, not the
//! reverse, so the estimator must stay asymmetric.
//!
//! ## Aggregation
//!
//! Within a transcript: (weighted) arithmetic mean over questions.
//! Across transcripts: plain mean plus std dev and standard error, so the
//! search controller can tell a real improvement from sampling noise.
//!
//! Everything in this module is pure math over already-collected
//! distributions - no oracle access - which is what makes it unit-testable
//! with synthetic vectors.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::AnswerDistribution;

/// KL(p || q) in nats over two parallel probability vectors.
///
/// Inputs are assumed smoothed and normalized (see
/// [`AnswerDistribution::from_probs`]), so every term is finite. Returns
/// `None` on dimension mismatch.
pub fn kl_divergence(p: &AnswerDistribution, q: &AnswerDistribution) -> Option<f64> {
    if p.len() != q.len() || p.is_empty() {
        return None;
    }
    let kl: f64 = p
        .probs()
        .iter()
        .zip(q.probs().iter())
        .map(|(pi, qi)| pi * (pi / qi).ln())
        .sum();
    // Smoothing can leave a tiny negative residue for near-identical vectors.
    Some(kl.max(0.0))
}

/// KL divergence straight from two log-probability vectors.
///
/// Convenience for backends that return token logprobs: converts both sides
/// with epsilon smoothing, then computes KL(p || q). `None` when either side
/// fails conversion or lengths differ.
pub fn kl_divergence_logprobs(p_logp: &[f64], q_logp: &[f64]) -> Option<f64> {
    if p_logp.len() != q_logp.len() {
        return None;
    }
    let p = AnswerDistribution::from_logprobs(p_logp)?;
    let q = AnswerDistribution::from_logprobs(q_logp)?;
    kl_divergence(&p, &q)
}

/// Per-question divergences for one transcript, with the weighted aggregate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionDivergences {
    /// Weighted mean over the questions that could be compared
    pub aggregate: f64,
    /// Question id -> KL(full || template)
    pub per_question: HashMap<String, f64>,
    /// Question ids present in only one context, or with mismatched
    /// vocabulary dimensions. Skipped, never counted as zero.
    pub skipped: Vec<String>,
}

impl QuestionDivergences {
    /// Questions sorted worst-predicted first (highest divergence).
    pub fn worst_first(&self) -> Vec<(&str, f64)> {
        let mut pairs: Vec<(&str, f64)> = self
            .per_question
            .iter()
            .map(|(id, kl)| (id.as_str(), *kl))
            .collect();
        pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        pairs
    }
}

/// Estimate the divergence between two conditioning contexts over a question
/// set.
///
/// `full` and `template` map question id -> answer distribution for the same
/// transcript. `weights` (question id -> weight, default 1.0) lets callers
/// up-weight discriminative questions. Pure function; no side effects.
pub fn estimate(
    full: &HashMap<String, AnswerDistribution>,
    template: &HashMap<String, AnswerDistribution>,
    weights: Option<&HashMap<String, f64>>,
) -> QuestionDivergences {
    let mut per_question = HashMap::new();
    let mut skipped = Vec::new();

    let mut weighted_sum = 0.0;
    let mut weight_total = 0.0;

    for (question_id, p) in full {
        let Some(q) = template.get(question_id) else {
            skipped.push(question_id.clone());
            continue;
        };
        match kl_divergence(p, q) {
            Some(kl) => {
                let w = weights
                    .and_then(|m| m.get(question_id))
                    .copied()
                    .unwrap_or(1.0);
                weighted_sum += w * kl;
                weight_total += w;
                per_question.insert(question_id.clone(), kl);
            }
            None => skipped.push(question_id.clone()),
        }
    }

    // Questions answered only under the template context are skipped too.
    for question_id in template.keys() {
        if !full.contains_key(question_id) {
            skipped.push(question_id.clone());
        }
    }
    skipped.sort();

    let aggregate = if weight_total > 0.0 {
        weighted_sum / weight_total
    } else {
        0.0
    };

    QuestionDivergences {
        aggregate,
        per_question,
        skipped,
    }
}

/// Divergence result for a single (template, transcript) pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptDivergence {
    pub transcript_id: String,
    pub divergences: QuestionDivergences,
}

/// Aggregated divergence over a population of transcripts.
///
/// Mean is the fitness scalar; std dev and standard error let the controller
/// require improvement beyond noise before accepting a candidate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DivergenceReport {
    /// Mean of per-transcript aggregates (the fitness scalar)
    pub mean: f64,
    /// Sample standard deviation across transcripts
    pub std_dev: f64,
    /// Standard error of the mean
    pub std_err: f64,
    /// Number of transcripts that contributed
    pub n_transcripts: usize,
    /// Pooled per-question mean divergence across transcripts
    pub per_question_mean: HashMap<String, f64>,
}

impl DivergenceReport {
    /// Aggregate per-transcript results into a population report.
    pub fn aggregate(per_transcript: &[TranscriptDivergence]) -> Self {
        if per_transcript.is_empty() {
            return Self::default();
        }

        let aggregates: Vec<f64> = per_transcript
            .iter()
            .map(|t| t.divergences.aggregate)
            .collect();
        let mean = mean(&aggregates);
        let std_dev = std_dev(&aggregates);
        let std_err = std_dev / (aggregates.len() as f64).sqrt();

        // Pool question divergences across transcripts
        let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
        for t in per_transcript {
            for (qid, kl) in &t.divergences.per_question {
                let entry = sums.entry(qid.clone()).or_insert((0.0, 0));
                entry.0 += kl;
                entry.1 += 1;
            }
        }
        let per_question_mean = sums
            .into_iter()
            .map(|(qid, (sum, n))| (qid, sum / n as f64))
            .collect();

        DivergenceReport {
            mean,
            std_dev,
            std_err,
            n_transcripts: per_transcript.len(),
            per_question_mean,
        }
    }
}

// === Utility functions ===

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}
