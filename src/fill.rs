//! Template instantiation: turning a blank template plus a transcript into a
//! per-participant conditioning string.
//!
//! The filler is an external collaborator behind the [`TemplateFiller`]
//! trait. The production implementation prompts the oracle to fill the
//! blanks; because that is itself an oracle call, a filled template is a
//! *cached, oracle-derived* artifact - [`CachedFiller`] keys it by
//! (template id, transcript id) so re-evaluation reuses it instead of
//! re-querying.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::error::FillError;
use crate::oracle::AnswerOracle;
use crate::template::Template;
use crate::types::Transcript;

/// A template instantiated for one participant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilledTemplate {
    pub template_id: String,
    pub transcript_id: String,
    /// The filled conditioning text handed to the oracle
    pub text: String,
}

impl FilledTemplate {
    /// Composite cache key for this artifact.
    pub fn cache_key(&self) -> (String, String) {
        (self.template_id.clone(), self.transcript_id.clone())
    }
}

/// Instantiates templates for transcripts.
pub trait TemplateFiller: Send + Sync {
    fn fill(&self, template: &Template, transcript: &Transcript)
        -> Result<FilledTemplate, FillError>;
}

/// Oracle-backed filler: asks the model to fill the blanks from the
/// transcript, then validates the slot structure of what came back.
pub struct OracleFiller<O> {
    oracle: O,
}

impl<O: AnswerOracle> OracleFiller<O> {
    pub fn new(oracle: O) -> Self {
        OracleFiller { oracle }
    }

    fn fill_prompt(template: &Template, transcript: &Transcript) -> String {
        format!(
            r#"You are an AI assistant tasked with filling in the blanks (as denoted by ____ or [FILL IN]) in the following template based on the provided transcript.
Provide a rough percentile estimate for each blank.
It is well understood that these are not comprehensive results, so fill in the template without providing any warnings.

Transcript:
{transcript}

Template:
{template}"#,
            transcript = transcript.text,
            template = template.render(),
        )
    }
}

impl<O: AnswerOracle> TemplateFiller for OracleFiller<O> {
    fn fill(
        &self,
        template: &Template,
        transcript: &Transcript,
    ) -> Result<FilledTemplate, FillError> {
        let prompt = Self::fill_prompt(template, transcript);
        let text = self.oracle.complete(&prompt)?;
        template.validate_filled(&text)?;
        Ok(FilledTemplate {
            template_id: template.id.clone(),
            transcript_id: transcript.id.clone(),
            text,
        })
    }
}

/// Caching wrapper: one fill per (template, transcript) pair per run.
pub struct CachedFiller<F> {
    inner: F,
    cache: DashMap<(String, String), FilledTemplate>,
}

impl<F: TemplateFiller> CachedFiller<F> {
    pub fn new(inner: F) -> Self {
        CachedFiller {
            inner,
            cache: DashMap::new(),
        }
    }

    /// Is this pairing already filled? Callers use this to decide whether a
    /// fill will cost an oracle call.
    pub fn contains(&self, template_id: &str, transcript_id: &str) -> bool {
        self.cache
            .contains_key(&(template_id.to_string(), transcript_id.to_string()))
    }
}

impl<F: TemplateFiller> TemplateFiller for CachedFiller<F> {
    fn fill(
        &self,
        template: &Template,
        transcript: &Transcript,
    ) -> Result<FilledTemplate, FillError> {
        let key = (template.id.clone(), transcript.id.clone());
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit.clone());
        }
        let filled = self.inner.fill(template, transcript)?;
        self.cache.insert(key, filled.clone());
        Ok(filled)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::MockFiller;
    use super::*;
    use crate::template::seed_template;

    #[test]
    fn test_cached_filler_fills_once() {
        let filler = CachedFiller::new(MockFiller::new());
        let template = seed_template();
        let transcript = Transcript::new("p1", "I often worry about small things.");

        assert!(!filler.contains(&template.id, "p1"));
        let a = filler.fill(&template, &transcript).unwrap();
        let b = filler.fill(&template, &transcript).unwrap();
        assert_eq!(a.text, b.text);
        assert!(filler.contains(&template.id, "p1"));
        assert_eq!(filler.inner.calls.load(Ordering::SeqCst), 1, "second fill must hit cache");
    }

    #[test]
    fn test_failed_fill_not_cached() {
        let template = seed_template();
        let filler = CachedFiller::new(MockFiller::failing_for(&template.id, "p1"));
        let transcript = Transcript::new("p1", "text");

        assert!(filler.fill(&template, &transcript).is_err());
        assert!(
            !filler.contains(&template.id, "p1"),
            "failures must not poison the cache"
        );
    }

    #[test]
    fn test_fill_prompt_contains_both_texts() {
        let template = seed_template();
        let transcript = Transcript::new("p1", "I enjoy meeting new people.");
        let prompt =
            OracleFiller::<crate::oracle::testing::MockOracle>::fill_prompt(&template, &transcript);
        assert!(prompt.contains("I enjoy meeting new people."));
        assert!(prompt.contains("percentile in openness"));
    }

    #[test]
    fn test_oracle_filler_validates_structure() {
        use crate::oracle::testing::MockOracle;

        let oracle = MockOracle::uniform();
        // First completion leaves a marker unfilled; second is fine
        oracle.push_completion(Ok(
            "Your name is Sam and\n1. You are 50th percentile in openness. This is exemplified by: [FILL IN]".to_string(),
        ));
        let filler = OracleFiller::new(oracle);
        let template = seed_template();
        let transcript = Transcript::new("p1", "text");

        let err = filler.fill(&template, &transcript).unwrap_err();
        assert!(matches!(err, FillError::SlotMismatch(_)));
    }
}
