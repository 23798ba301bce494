//! The evolution loop and its run state.
//!
//! - [`schemas`]: evaluation records, generation summaries, append-only
//!   history
//! - [`select`]: elitism + inverse-distance weighted exploration
//! - [`evaluate`]: per-generation fan-out over transcripts and questions
//! - [`controller`]: the generational state machine that owns a run

pub mod controller;
pub mod evaluate;
pub mod schemas;
pub mod select;

pub use controller::{load_templates, Phase, SearchController, SearchResult};
pub use evaluate::{evaluate_template, EvalContext, EvaluationDetail};
pub use schemas::{
    CandidateStatus, EvaluationRecord, Exclusion, GenerationSummary, RunHistory, RunOutcome,
};
pub use select::select_parents;
