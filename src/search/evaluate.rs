//! Generation evaluation: fanning one template out over every transcript and
//! question under both conditioning contexts.
//!
//! Pipelining strategy (per template):
//! 1. Fill the template for every transcript in parallel (cached per pair).
//! 2. Check the answer cache for all (transcript, question, context) cells,
//!    separating hits from misses.
//! 3. Dispatch ALL misses concurrently on the bounded worker pool.
//! 4. Merge results by key - arrival order is irrelevant - and reduce to
//!    per-transcript divergences.
//!
//! Failures stay local: a failed fill excludes one pairing, a failed query
//! excludes one question cell, and both are recorded in the evaluation
//! record's exclusion list. Only a template with zero usable pairs gets a
//! `Failed` record. Every real oracle call passes through the budget meter,
//! so a spent budget stops traffic mid-generation instead of overshooting.

use std::collections::HashMap;

use rayon::prelude::*;

use crate::cache::{AnswerCache, BudgetMeter};
use crate::divergence::{estimate, DivergenceReport, TranscriptDivergence};
use crate::fill::{CachedFiller, TemplateFiller};
use crate::oracle::AnswerOracle;
use crate::search::schemas::{now_secs, CandidateStatus, EvaluationRecord, Exclusion};
use crate::template::Template;
use crate::types::{AnswerDistribution, AnswerKey, Question, QuestionSet, Transcript};

/// Everything an evaluation needs, borrowed from the controller.
pub struct EvalContext<'a, O, F> {
    pub oracle: &'a O,
    pub filler: &'a CachedFiller<F>,
    pub cache: &'a AnswerCache,
    pub meter: &'a BudgetMeter,
    pub questions: &'a QuestionSet,
    pub transcripts: &'a [Transcript],
    pub pool: &'a rayon::ThreadPool,
}

/// Evaluation record plus the transient detail the breeder needs
/// (per-transcript divergences and filled texts are not persisted).
pub struct EvaluationDetail {
    pub record: EvaluationRecord,
    pub per_transcript: Vec<TranscriptDivergence>,
    /// transcript id -> filled template text
    pub fills: HashMap<String, String>,
}

/// Conditioning string handed to the oracle for a context.
fn conditioning(text: &str, questions: &QuestionSet) -> String {
    if questions.instructions.is_empty() {
        text.to_string()
    } else {
        format!(
            "{}\n\nQuestionnaire instructions:\n{}",
            text, questions.instructions
        )
    }
}

/// Evaluate one template over all transcripts and questions.
pub fn evaluate_template<O: AnswerOracle, F: TemplateFiller>(
    ctx: &EvalContext<'_, O, F>,
    template: &Template,
    generation: usize,
) -> EvaluationDetail {
    let calls_before = ctx.meter.used();
    let mut excluded: Vec<Exclusion> = Vec::new();

    // Phase 1: fill the template for every transcript (parallel, cached)
    let fill_results: Vec<(String, Result<String, String>)> = ctx.pool.install(|| {
        ctx.transcripts
            .par_iter()
            .map(|transcript| {
                let needs_call = !ctx.filler.contains(&template.id, &transcript.id);
                if needs_call && !ctx.meter.try_charge() {
                    return (
                        transcript.id.clone(),
                        Err("oracle budget exhausted".to_string()),
                    );
                }
                match ctx.filler.fill(template, transcript) {
                    Ok(filled) => (transcript.id.clone(), Ok(filled.text)),
                    Err(err) => (transcript.id.clone(), Err(err.to_string())),
                }
            })
            .collect()
    });

    let mut fills: HashMap<String, String> = HashMap::new();
    for (transcript_id, result) in fill_results {
        match result {
            Ok(text) => {
                fills.insert(transcript_id, text);
            }
            Err(reason) => excluded.push(Exclusion {
                transcript_id,
                question_id: None,
                reason,
            }),
        }
    }

    // Phase 2: cache check for every answer cell, collect misses
    struct WorkItem {
        key: AnswerKey,
        context: String,
        question: Question,
    }

    let mut cached: HashMap<AnswerKey, AnswerDistribution> = HashMap::new();
    let mut misses: Vec<WorkItem> = Vec::new();

    for transcript in ctx.transcripts {
        let Some(filled_text) = fills.get(&transcript.id) else {
            continue;
        };
        for question in &ctx.questions.questions {
            let cells = [
                (
                    AnswerKey::transcript(&transcript.id, &question.id),
                    conditioning(&transcript.text, ctx.questions),
                ),
                (
                    AnswerKey::template(&template.id, &transcript.id, &question.id),
                    conditioning(filled_text, ctx.questions),
                ),
            ];
            for (key, context) in cells {
                if let Some(hit) = ctx.cache.get(&key) {
                    cached.insert(key, hit);
                } else {
                    misses.push(WorkItem {
                        key,
                        context,
                        question: question.clone(),
                    });
                }
            }
        }
    }

    // Phase 3: dispatch all misses concurrently, bounded by the pool
    let fresh: Vec<(AnswerKey, Result<AnswerDistribution, String>)> = ctx.pool.install(|| {
        misses
            .par_iter()
            .map(|item| {
                if !ctx.meter.try_charge() {
                    return (item.key.clone(), Err("oracle budget exhausted".to_string()));
                }
                match ctx.oracle.query(&item.context, &item.question) {
                    Ok(dist) => {
                        ctx.cache.put(item.key.clone(), dist.clone());
                        (item.key.clone(), Ok(dist))
                    }
                    Err(err) => (item.key.clone(), Err(err.to_string())),
                }
            })
            .collect()
    });

    let mut failures: HashMap<AnswerKey, String> = HashMap::new();
    for (key, result) in fresh {
        match result {
            Ok(dist) => {
                cached.insert(key, dist);
            }
            Err(reason) => {
                failures.insert(key, reason);
            }
        }
    }

    // Phase 4: reduce to per-transcript divergences
    let mut per_transcript = Vec::new();
    for transcript in ctx.transcripts {
        if !fills.contains_key(&transcript.id) {
            continue;
        }
        let mut full: HashMap<String, AnswerDistribution> = HashMap::new();
        let mut templ: HashMap<String, AnswerDistribution> = HashMap::new();

        for question in &ctx.questions.questions {
            let full_key = AnswerKey::transcript(&transcript.id, &question.id);
            let templ_key = AnswerKey::template(&template.id, &transcript.id, &question.id);

            match (cached.get(&full_key), cached.get(&templ_key)) {
                (Some(p), Some(q)) => {
                    full.insert(question.id.clone(), p.clone());
                    templ.insert(question.id.clone(), q.clone());
                }
                _ => {
                    let reason = failures
                        .get(&full_key)
                        .or_else(|| failures.get(&templ_key))
                        .cloned()
                        .unwrap_or_else(|| "answer unavailable".to_string());
                    excluded.push(Exclusion {
                        transcript_id: transcript.id.clone(),
                        question_id: Some(question.id.clone()),
                        reason,
                    });
                }
            }
        }

        if full.is_empty() {
            continue;
        }
        let divergences = estimate(&full, &templ, Some(&ctx.questions.weights));
        per_transcript.push(TranscriptDivergence {
            transcript_id: transcript.id.clone(),
            divergences,
        });
    }

    let oracle_calls = ctx.meter.used() - calls_before;

    if per_transcript.is_empty() {
        return EvaluationDetail {
            record: EvaluationRecord::failed(
                &template.id,
                generation,
                "no transcript produced a comparable answer pair",
                excluded,
                oracle_calls,
            ),
            per_transcript: Vec::new(),
            fills,
        };
    }

    let report = DivergenceReport::aggregate(&per_transcript);
    let record = EvaluationRecord {
        template_id: template.id.clone(),
        generation,
        status: CandidateStatus::Ok,
        aggregate: Some(report.mean),
        std_err: report.std_err,
        per_question: report.per_question_mean,
        per_transcript: per_transcript
            .iter()
            .map(|t| (t.transcript_id.clone(), t.divergences.aggregate))
            .collect(),
        excluded,
        oracle_calls,
        timestamp: now_secs(),
    };

    EvaluationDetail {
        record,
        per_transcript,
        fills,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::fill::testing::MockFiller;
    use crate::oracle::testing::MockOracle;
    use crate::template::seed_template;

    fn pool() -> rayon::ThreadPool {
        rayon::ThreadPoolBuilder::new()
            .num_threads(2)
            .build()
            .unwrap()
    }

    fn questions(n: usize) -> QuestionSet {
        QuestionSet::new(
            "Answer 1-5.",
            (0..n)
                .map(|i| Question::likert(format!("q{}", i), format!("prompt {}", i)))
                .collect(),
        )
    }

    fn transcripts(n: usize) -> Vec<Transcript> {
        (0..n)
            .map(|i| Transcript::new(format!("p{}", i), format!("transcript text {}", i)))
            .collect()
    }

    /// Oracle that answers peaked for transcript contexts and uniform for
    /// filled-template contexts (MockFiller texts start with "filled:").
    fn discriminating_oracle() -> MockOracle {
        MockOracle::new(|context, question| {
            let n = question.vocabulary.len();
            if context.contains("filled:") {
                AnswerDistribution::uniform(n)
            } else {
                let mut probs = vec![0.1; n];
                probs[n / 2] = 0.6;
                AnswerDistribution::from_probs(&probs)
            }
            .ok_or_else(|| OracleError::Malformed("empty vocab".into()))
        })
    }

    fn context<'a, O, F>(
        oracle: &'a O,
        filler: &'a CachedFiller<F>,
        cache: &'a AnswerCache,
        meter: &'a BudgetMeter,
        questions: &'a QuestionSet,
        transcripts: &'a [Transcript],
        pool: &'a rayon::ThreadPool,
    ) -> EvalContext<'a, O, F> {
        EvalContext {
            oracle,
            filler,
            cache,
            meter,
            questions,
            transcripts,
            pool,
        }
    }

    #[test]
    fn test_identical_contexts_give_zero_divergence() {
        let oracle = MockOracle::uniform();
        let filler = CachedFiller::new(MockFiller::new());
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::unlimited();
        let qs = questions(3);
        let ts = transcripts(2);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);

        let detail = evaluate_template(&ctx, &seed_template(), 0);
        assert!(detail.record.is_ok());
        assert!(
            detail.record.aggregate.unwrap() < 1e-6,
            "same distribution under both contexts must give ~0 divergence"
        );
        assert_eq!(detail.record.per_transcript.len(), 2);
        assert!(detail.record.excluded.is_empty());
    }

    #[test]
    fn test_differing_contexts_give_positive_divergence() {
        let oracle = discriminating_oracle();
        let filler = CachedFiller::new(MockFiller::new());
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::unlimited();
        let qs = questions(3);
        let ts = transcripts(2);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);

        let detail = evaluate_template(&ctx, &seed_template(), 0);
        assert!(detail.record.aggregate.unwrap() > 0.1);
        assert!(detail.record.std_err >= 0.0);
    }

    #[test]
    fn test_second_evaluation_is_free() {
        let oracle = MockOracle::uniform();
        let filler = CachedFiller::new(MockFiller::new());
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::unlimited();
        let qs = questions(4);
        let ts = transcripts(3);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);
        let template = seed_template();

        let first = evaluate_template(&ctx, &template, 0);
        let queries_after_first = oracle.queries();
        assert!(queries_after_first > 0);

        let second = evaluate_template(&ctx, &template, 1);
        assert_eq!(
            oracle.queries(),
            queries_after_first,
            "re-evaluating a cached template must not re-query the oracle"
        );
        assert_eq!(second.record.oracle_calls, 0);
        assert_eq!(first.record.aggregate, second.record.aggregate);
    }

    #[test]
    fn test_fill_failure_is_isolated() {
        let template = seed_template();
        let oracle = MockOracle::uniform();
        let filler = CachedFiller::new(MockFiller::failing_for(&template.id, "p0"));
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::unlimited();
        let qs = questions(2);
        let ts = transcripts(3);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);

        let detail = evaluate_template(&ctx, &template, 0);
        assert!(detail.record.is_ok(), "one bad pairing must not fail the candidate");
        assert_eq!(detail.record.per_transcript.len(), 2);
        assert!(!detail.record.per_transcript.contains_key("p0"));

        let fill_exclusions: Vec<_> = detail
            .record
            .excluded
            .iter()
            .filter(|e| e.question_id.is_none())
            .collect();
        assert_eq!(fill_exclusions.len(), 1);
        assert_eq!(fill_exclusions[0].transcript_id, "p0");
    }

    #[test]
    fn test_query_failure_excludes_single_cell() {
        // Fail exactly one question's transcript-context query
        let oracle = MockOracle::new(|context, question| {
            if question.id == "q1" && !context.contains("filled:") {
                return Err(OracleError::Auth("revoked".into()));
            }
            AnswerDistribution::uniform(question.vocabulary.len())
                .ok_or_else(|| OracleError::Malformed("empty".into()))
        });
        let filler = CachedFiller::new(MockFiller::new());
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::unlimited();
        let qs = questions(3);
        let ts = transcripts(1);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);

        let detail = evaluate_template(&ctx, &seed_template(), 0);
        assert!(detail.record.is_ok());
        let cell_exclusions: Vec<_> = detail
            .record
            .excluded
            .iter()
            .filter(|e| e.question_id.as_deref() == Some("q1"))
            .collect();
        assert_eq!(cell_exclusions.len(), 1);
        // The other two questions still contributed
        assert_eq!(detail.per_transcript[0].divergences.per_question.len(), 2);
    }

    #[test]
    fn test_budget_caps_oracle_traffic() {
        let oracle = MockOracle::uniform();
        let filler = CachedFiller::new(MockFiller::new());
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::new(Some(5));
        let qs = questions(10);
        let ts = transcripts(4);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);

        let detail = evaluate_template(&ctx, &seed_template(), 0);
        assert!(meter.used() <= 5, "hard budget gate must hold");
        assert!(meter.exhausted());
        assert!(
            !detail.record.excluded.is_empty(),
            "budget-refused cells must be recorded as exclusions"
        );
    }

    #[test]
    fn test_all_fills_failing_fails_candidate() {
        let template = seed_template();
        let oracle = MockOracle::uniform();
        // Every transcript shares the failing pair id
        let filler = CachedFiller::new(MockFiller::failing_for(&template.id, "p0"));
        let cache = AnswerCache::in_memory();
        let meter = BudgetMeter::unlimited();
        let qs = questions(2);
        let ts = transcripts(1);
        let pool = pool();
        let ctx = context(&oracle, &filler, &cache, &meter, &qs, &ts, &pool);

        let detail = evaluate_template(&ctx, &template, 0);
        assert!(!detail.record.is_ok());
        assert!(detail.record.aggregate.is_none());
        assert_eq!(oracle.queries(), 0, "no fills means no answer queries");
    }
}
