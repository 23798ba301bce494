//! evoloop - evolutionary search for latent templates.
//!
//! Searches for a compact natural-language template that, once filled per
//! participant, makes a language model answer questionnaires the way it would
//! with the participant's full transcript as context. Fitness is the
//! KL divergence between the answer distributions under the two contexts;
//! lower is better.
//!
//! # Architecture
//!
//! ```text
//! Templates → Fill (oracle) → Answer Distributions → KL Divergence → Select/Breed
//!     ↓            ↓                  ↓                    ↓              ↓
//!  typed slot   cached per        cached per        pure math,      elitism +
//!  schema      (tmpl,participant) (ctx,question)   mean ± stderr    weighted explore
//! ```
//!
//! The loop is sequential across generations; within a generation all oracle
//! traffic fans out on a bounded worker pool. Every call is metered against
//! a run budget and every answer is cached by its composite key, so resumed
//! or re-evaluated work is free.
//!
//! # Layers
//!
//! - [`types`]: transcripts, questions, validated answer distributions
//! - [`template`]: typed slot schema with fork/lineage
//! - [`divergence`]: the pure KL estimator and aggregation
//! - [`oracle`]: the LLM boundary - CLI adapter, retry, timeout
//! - [`fill`]: oracle-backed template instantiation, cached per pairing
//! - [`cache`]: shared answer cache (DashMap + optional redb) and budget
//! - [`generate`]: structured mutation and oracle-guided rewrite
//! - [`search`]: the evolution loop, selection, and the append-only history

pub mod cache;
pub mod config;
pub mod divergence;
pub mod error;
pub mod fill;
pub mod generate;
pub mod oracle;
pub mod plots;
pub mod search;
pub mod template;
pub mod types;

// Re-export core types
pub use cache::{AnswerCache, BudgetMeter};
pub use config::Config;
pub use divergence::{estimate, kl_divergence, DivergenceReport, TranscriptDivergence};
pub use error::{FillError, OracleError};
pub use fill::{CachedFiller, FilledTemplate, OracleFiller, TemplateFiller};
pub use generate::{CandidateGenerator, RewriteEvidence, Strategy};
pub use oracle::{Agent, AnswerOracle, CliOracle, RetryPolicy, Retrying};
pub use search::{RunHistory, RunOutcome, SearchController, SearchResult};
pub use template::{seed_template, Slot, SlotKind, Template};
pub use types::{AnswerDistribution, AnswerKey, ContextKind, Question, QuestionSet, Transcript};
