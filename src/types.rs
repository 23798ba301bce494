//! Core types for evoloop - transcripts, questions, and answer distributions.
//!
//! Everything here is frozen by default: a `Transcript` or `Question` never
//! changes after a run starts, and an `AnswerDistribution` is validated at
//! construction so downstream math can assume a proper probability vector.

use serde::{Deserialize, Serialize};

/// Tolerance for "this probability vector sums to 1".
pub const SUM_TOLERANCE: f64 = 1e-6;

/// Smoothing floor applied to probabilities before divergence computation.
/// Prevents infinite KL terms when a vocabulary element gets exact zero mass.
pub const PROB_EPSILON: f64 = 1e-6;

/// Which conditioning context produced an answer distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContextKind {
    /// The full participant transcript.
    FullTranscript,
    /// A latent template filled for that participant.
    FilledTemplate,
}

impl ContextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextKind::FullTranscript => "transcript",
            ContextKind::FilledTemplate => "template",
        }
    }
}

/// Full text record for one participant. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcript {
    /// Identifier, e.g. "participant_001"
    pub id: String,
    /// Raw transcript text
    pub text: String,
}

impl Transcript {
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Transcript {
            id: id.into(),
            text: text.into(),
        }
    }
}

/// A single questionnaire item with a fixed finite answer vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    /// Identifier, e.g. "neo_017"
    pub id: String,
    /// Prompt text shown to the model
    pub prompt: String,
    /// Answer vocabulary; defaults to the 1-5 Likert scale
    #[serde(default = "default_vocabulary")]
    pub vocabulary: Vec<String>,
}

fn default_vocabulary() -> Vec<String> {
    (1..=5).map(|v| v.to_string()).collect()
}

impl Question {
    /// Likert 1-5 item (the common case for the questionnaires this targets).
    pub fn likert(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Question {
            id: id.into(),
            prompt: prompt.into(),
            vocabulary: (1..=5).map(|v| v.to_string()).collect(),
        }
    }
}

/// The question set for a run. Immutable for the run's duration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionSet {
    /// Instructions prepended when administering the questionnaire
    pub instructions: String,
    /// All questions, in administration order
    pub questions: Vec<Question>,
    /// Per-question weights for the aggregate divergence.
    /// Missing entries default to 1.0.
    #[serde(default)]
    pub weights: std::collections::HashMap<String, f64>,
}

impl QuestionSet {
    pub fn new(instructions: impl Into<String>, questions: Vec<Question>) -> Self {
        QuestionSet {
            instructions: instructions.into(),
            questions,
            weights: Default::default(),
        }
    }

    /// Weight for a question id (1.0 when unspecified).
    pub fn weight(&self, question_id: &str) -> f64 {
        self.weights.get(question_id).copied().unwrap_or(1.0)
    }

    pub fn len(&self) -> usize {
        self.questions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.questions.is_empty()
    }
}

/// A categorical probability vector over a question's answer vocabulary.
///
/// The vector is parallel to `Question::vocabulary`. Constructors normalize
/// and epsilon-smooth so every element is strictly positive and the vector
/// sums to 1 within `SUM_TOLERANCE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerDistribution {
    probs: Vec<f64>,
}

impl AnswerDistribution {
    /// Build from raw (possibly unnormalized) probabilities.
    ///
    /// Each element gets `PROB_EPSILON` added before normalization, the guard
    /// against exact-zero mass. Returns `None` for an empty vector or
    /// non-finite/negative input.
    pub fn from_probs(raw: &[f64]) -> Option<Self> {
        if raw.is_empty() || raw.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return None;
        }
        let smoothed: Vec<f64> = raw.iter().map(|p| p + PROB_EPSILON).collect();
        let total: f64 = smoothed.iter().sum();
        if total <= 0.0 {
            return None;
        }
        Some(AnswerDistribution {
            probs: smoothed.iter().map(|p| p / total).collect(),
        })
    }

    /// Build from log-probabilities (the form a logprobs-capable backend
    /// returns). Exponentiates, then smooths and normalizes like
    /// [`from_probs`](Self::from_probs).
    pub fn from_logprobs(logprobs: &[f64]) -> Option<Self> {
        if logprobs.iter().any(|lp| lp.is_nan() || *lp > 0.0) {
            return None;
        }
        let probs: Vec<f64> = logprobs.iter().map(|lp| lp.exp()).collect();
        Self::from_probs(&probs)
    }

    /// Uniform distribution over `n` vocabulary elements.
    pub fn uniform(n: usize) -> Option<Self> {
        if n == 0 {
            return None;
        }
        Self::from_probs(&vec![1.0 / n as f64; n])
    }

    /// The normalized probability vector.
    pub fn probs(&self) -> &[f64] {
        &self.probs
    }

    pub fn len(&self) -> usize {
        self.probs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probs.is_empty()
    }

    /// Well-formedness check: strictly positive elements summing to 1.
    pub fn is_valid(&self) -> bool {
        let total: f64 = self.probs.iter().sum();
        (total - 1.0).abs() <= SUM_TOLERANCE && self.probs.iter().all(|p| *p > 0.0)
    }
}

/// Composite cache key for one oracle answer: which template, which
/// participant, which question, and under which conditioning context.
///
/// `FullTranscript` answers do not depend on the template, so the template
/// component is empty for that context kind - one transcript answer serves
/// every candidate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnswerKey {
    pub template_id: String,
    pub transcript_id: String,
    pub question_id: String,
    pub context: ContextKind,
}

impl AnswerKey {
    pub fn template(template_id: &str, transcript_id: &str, question_id: &str) -> Self {
        AnswerKey {
            template_id: template_id.to_string(),
            transcript_id: transcript_id.to_string(),
            question_id: question_id.to_string(),
            context: ContextKind::FilledTemplate,
        }
    }

    pub fn transcript(transcript_id: &str, question_id: &str) -> Self {
        AnswerKey {
            template_id: String::new(),
            transcript_id: transcript_id.to_string(),
            question_id: question_id.to_string(),
            context: ContextKind::FullTranscript,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_probs_normalizes() {
        let d = AnswerDistribution::from_probs(&[2.0, 2.0, 4.0]).unwrap();
        assert!(d.is_valid());
        assert!((d.probs()[2] - 0.5).abs() < 1e-3);
    }

    #[test]
    fn test_from_probs_smooths_zeros() {
        let d = AnswerDistribution::from_probs(&[1.0, 0.0]).unwrap();
        assert!(d.probs()[1] > 0.0, "zero mass should be smoothed away");
        assert!(d.is_valid());
    }

    #[test]
    fn test_from_probs_rejects_bad_input() {
        assert!(AnswerDistribution::from_probs(&[]).is_none());
        assert!(AnswerDistribution::from_probs(&[0.5, -0.1]).is_none());
        assert!(AnswerDistribution::from_probs(&[0.5, f64::NAN]).is_none());
    }

    #[test]
    fn test_from_logprobs() {
        // ln(0.5) twice -> uniform over 2
        let lp = 0.5f64.ln();
        let d = AnswerDistribution::from_logprobs(&[lp, lp]).unwrap();
        assert!((d.probs()[0] - 0.5).abs() < 1e-6);
        assert!(
            AnswerDistribution::from_logprobs(&[0.1]).is_none(),
            "positive logprob is invalid"
        );
    }

    #[test]
    fn test_uniform() {
        let d = AnswerDistribution::uniform(5).unwrap();
        assert_eq!(d.len(), 5);
        assert!((d.probs()[0] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_answer_key_transcript_ignores_template() {
        let a = AnswerKey::transcript("p1", "q1");
        let b = AnswerKey::transcript("p1", "q1");
        assert_eq!(a, b);
        assert_eq!(a.context, ContextKind::FullTranscript);
    }
}
