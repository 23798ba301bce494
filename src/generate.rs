//! Candidate generation: proposing the next templates to evaluate.
//!
//! Two strategies, selectable by configuration:
//!
//! - **Structured mutation**: syntactic edits to the slot list - trait
//!   paraphrase swaps from a fixed lexicon, reordering, slot addition or
//!   removal. Cheap, no oracle traffic, keeps the population diverse.
//! - **Oracle-guided rewrite**: a meta-prompt carrying the current template,
//!   filled examples, and the worst/best-predicted questions with their
//!   divergences, asking the model to draft a template that should reduce
//!   divergence. Expensive, high signal.
//!
//! A rewrite that errors or comes back structurally invalid falls back to
//! mutation for that breeding step - a bad oracle day never aborts the loop.
//! Candidates always fork lineage and get fresh ids; parents are never
//! mutated in place.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use rand::prelude::*;

use crate::cache::BudgetMeter;
use crate::error::OracleError;
use crate::oracle::AnswerOracle;
use crate::template::{Slot, SlotKind, Template};
use crate::types::QuestionSet;

/// Trait-name paraphrases for mutation swaps.
static LEXICON: Lazy<HashMap<&'static str, Vec<&'static str>>> = Lazy::new(|| {
    HashMap::from([
        ("openness", vec!["curiosity", "imagination", "openness to experience"]),
        ("conscientiousness", vec!["diligence", "self-discipline", "orderliness"]),
        ("extraversion", vec!["sociability", "assertiveness", "gregariousness"]),
        ("agreeableness", vec!["warmth", "compassion", "cooperativeness"]),
        ("neuroticism", vec!["emotional instability", "anxiety proneness", "negative affect"]),
    ])
});

/// Pool of candidate traits for slot addition.
static TRAIT_POOL: &[&str] = &[
    "resilience",
    "impulsivity",
    "self-criticism",
    "optimism",
    "perfectionism",
    "risk tolerance",
    "social anxiety",
    "emotional expressiveness",
];

/// Minimum percentile slots a template keeps through mutation.
const MIN_TRAITS: usize = 2;

/// Proposal strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Structured mutation only
    Mutate,
    /// Oracle-guided rewrite only (mutation as failure fallback)
    Rewrite,
    /// One rewrite per breeding step, mutations for the rest of the litter
    #[default]
    Mixed,
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mutate" => Ok(Strategy::Mutate),
            "rewrite" => Ok(Strategy::Rewrite),
            "mixed" => Ok(Strategy::Mixed),
            _ => Err(format!("Unknown strategy: {}. Use 'mutate', 'rewrite', or 'mixed'", s)),
        }
    }
}

/// Evidence for one transcript, feeding the rewrite meta-prompt.
#[derive(Debug, Clone)]
pub struct TranscriptEvidence {
    pub transcript_id: String,
    /// The parent template filled for this participant
    pub filled_text: String,
    /// Worst-predicted questions: (prompt, divergence), highest first
    pub worst_questions: Vec<(String, f64)>,
    /// Best-predicted questions: (prompt, divergence), lowest first
    pub best_questions: Vec<(String, f64)>,
}

/// Aggregated evaluation evidence handed to the rewrite oracle.
#[derive(Debug, Clone, Default)]
pub struct RewriteEvidence {
    /// Parent's aggregate divergence across transcripts
    pub aggregate: f64,
    pub transcripts: Vec<TranscriptEvidence>,
}

/// Pick the k worst- and k best-predicted questions from per-question
/// divergences, resolving ids to prompt text.
pub fn top_bottom_k(
    per_question: &HashMap<String, f64>,
    questions: &QuestionSet,
    k: usize,
) -> (Vec<(String, f64)>, Vec<(String, f64)>) {
    let prompt_of: HashMap<&str, &str> = questions
        .questions
        .iter()
        .map(|q| (q.id.as_str(), q.prompt.as_str()))
        .collect();

    let mut ranked: Vec<(String, f64)> = per_question
        .iter()
        .map(|(qid, kl)| {
            let prompt = prompt_of.get(qid.as_str()).copied().unwrap_or(qid.as_str());
            (prompt.to_string(), *kl)
        })
        .collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let worst = ranked.iter().take(k).cloned().collect();
    let best = ranked.iter().rev().take(k).cloned().collect();
    (worst, best)
}

/// Proposes new candidate templates from the parent pool.
pub struct CandidateGenerator {
    pub strategy: Strategy,
    /// Candidates per breeding step
    pub litter_size: usize,
    rng: StdRng,
    next_index: usize,
}

impl CandidateGenerator {
    pub fn new(strategy: Strategy, litter_size: usize, seed: u64, next_index: usize) -> Self {
        CandidateGenerator {
            strategy,
            litter_size: litter_size.max(1),
            rng: StdRng::seed_from_u64(seed),
            next_index,
        }
    }

    fn next_id(&mut self) -> String {
        let id = format!("latent_{:03}", self.next_index);
        self.next_index += 1;
        id
    }

    /// Move the id counter forward (resume path: ids must stay unique across
    /// the run's whole lifetime).
    pub fn set_next_index(&mut self, next_index: usize) {
        self.next_index = self.next_index.max(next_index);
    }

    /// Produce the next litter from the selected parents.
    ///
    /// At least one candidate always comes back. Under `Rewrite`/`Mixed`, one
    /// oracle rewrite is attempted per step (budget permitting) against the
    /// first - best - parent; everything else is structured mutation.
    pub fn propose<O: AnswerOracle>(
        &mut self,
        parents: &[Template],
        evidence: &RewriteEvidence,
        oracle: &O,
        meter: &BudgetMeter,
        generation: usize,
    ) -> Vec<Template> {
        assert!(!parents.is_empty(), "breeding requires at least one parent");
        let mut litter = Vec::with_capacity(self.litter_size);

        let want_rewrite = matches!(self.strategy, Strategy::Rewrite | Strategy::Mixed)
            && !evidence.transcripts.is_empty();

        if want_rewrite && meter.try_charge() {
            match self.oracle_rewrite(&parents[0], evidence, oracle, generation) {
                Ok(child) => litter.push(child),
                Err(err) => {
                    println!("  rewrite failed ({}), falling back to mutation", err);
                }
            }
        }

        let mut parent_cycle = parents.iter().cycle();
        while litter.len() < self.litter_size {
            let parent = parent_cycle.next().expect("cycle over non-empty parents");
            litter.push(self.mutate(parent, generation));
        }

        litter
    }

    /// One structured mutation of a parent.
    pub fn mutate(&mut self, parent: &Template, generation: usize) -> Template {
        let preamble: Vec<Slot> = parent
            .slots
            .iter()
            .filter(|s| s.kind == SlotKind::FixedLabel)
            .cloned()
            .collect();
        let mut traits: Vec<String> = parent
            .trait_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();

        let op = self.rng.gen_range(0..4);
        let description = match op {
            0 => self.swap_trait(&mut traits),
            1 => {
                traits.shuffle(&mut self.rng);
                "reordered trait slots".to_string()
            }
            2 => self.add_trait(&mut traits),
            _ => self.remove_trait(&mut traits),
        };

        let mut slots = preamble;
        for name in &traits {
            slots.push(Slot::percentile(name.clone()));
            slots.push(Slot::exemplar(name.clone()));
        }

        let mut child = parent.fork(self.next_id(), generation, description);
        child.slots = slots;
        child
    }

    fn swap_trait(&mut self, traits: &mut Vec<String>) -> String {
        if traits.is_empty() {
            return self.add_trait(traits);
        }
        let idx = self.rng.gen_range(0..traits.len());
        let old = traits[idx].clone();
        let replacement = LEXICON
            .get(old.as_str())
            .and_then(|alts| alts.choose(&mut self.rng))
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.fresh_trait(traits));
        traits[idx] = replacement.clone();
        format!("swapped '{}' for '{}'", old, replacement)
    }

    fn add_trait(&mut self, traits: &mut Vec<String>) -> String {
        let fresh = self.fresh_trait(traits);
        traits.push(fresh.clone());
        format!("added slot '{}'", fresh)
    }

    fn remove_trait(&mut self, traits: &mut Vec<String>) -> String {
        if traits.len() <= MIN_TRAITS {
            // Keep the template informative; mutate sideways instead
            return self.swap_trait(traits);
        }
        let idx = self.rng.gen_range(0..traits.len());
        let removed = traits.remove(idx);
        format!("removed slot '{}'", removed)
    }

    fn fresh_trait(&mut self, existing: &[String]) -> String {
        let unused: Vec<&&str> = TRAIT_POOL
            .iter()
            .filter(|t| !existing.iter().any(|e| e == *t))
            .collect();
        match unused.choose(&mut self.rng) {
            Some(t) => t.to_string(),
            None => TRAIT_POOL
                .choose(&mut self.rng)
                .expect("trait pool is non-empty")
                .to_string(),
        }
    }

    /// Ask the oracle for a revised template given the evaluation evidence.
    pub fn oracle_rewrite<O: AnswerOracle>(
        &mut self,
        parent: &Template,
        evidence: &RewriteEvidence,
        oracle: &O,
        generation: usize,
    ) -> Result<Template, OracleError> {
        let prompt = build_rewrite_prompt(parent, evidence);
        let response = oracle.complete(&prompt)?;

        let id = self.next_id();
        let parsed = Template::parse(&id, generation, &response).ok_or_else(|| {
            OracleError::Malformed(format!(
                "rewrite response has no valid slot structure: {}",
                &response[..response.len().min(200)]
            ))
        })?;

        // Re-home the parsed slots onto a proper fork so lineage survives
        let mut child = parent.fork(id, generation, "oracle-guided rewrite");
        child.slots = parsed.slots;
        Ok(child)
    }
}

/// Build the rewrite meta-prompt from the parent template and evidence.
fn build_rewrite_prompt(parent: &Template, evidence: &RewriteEvidence) -> String {
    let mut prompt = String::new();

    prompt.push_str(
        "You are a template engineer. The template below is filled out per participant and used \
         as model context in place of a full transcript. Divergence measures how differently the \
         model answers questionnaire items under the filled template versus the full transcript; \
         lower is better.\n\n",
    );
    prompt.push_str(&format!(
        "Current template (mean divergence {:.4}):\n---\n{}\n---\n",
        evidence.aggregate,
        parent.render()
    ));

    for t in &evidence.transcripts {
        prompt.push_str(&format!("\nFilled template for {}:\n{}\n", t.transcript_id, t.filled_text));

        prompt.push_str("\nWorst-predicted questions (divergence):\n");
        for (i, (question, kl)) in t.worst_questions.iter().enumerate() {
            prompt.push_str(&format!("{}. \"{}\" - {:.4}\n", i + 1, question, kl));
        }

        prompt.push_str("\nBest-predicted questions (divergence):\n");
        for (i, (question, kl)) in t.best_questions.iter().enumerate() {
            prompt.push_str(&format!("{}. \"{}\" - {:.4}\n", i + 1, question, kl));
        }
    }

    prompt.push_str(&format!(
        "\nDraft a revised blank template that captures whatever the worst-predicted questions \
         depend on, and keeps what the best-predicted questions rely on. Keep the exact line \
         format \"N. You are {} percentile in <trait>. This is exemplified by: {}\" and only \
         change the trait names or the number of lines. Output the template between --- fences \
         with no commentary.\n",
        crate::template::BLANK_MARKER,
        crate::template::FILL_MARKER,
    ));

    prompt
}
