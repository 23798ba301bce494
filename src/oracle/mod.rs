//! The answer-oracle boundary.
//!
//! The search core never talks to an LLM backend directly - it goes through
//! the [`AnswerOracle`] trait, which exposes exactly two capabilities:
//!
//! - [`query`](AnswerOracle::query): an answer distribution over a question's
//!   fixed vocabulary, given a conditioning context
//! - [`complete`](AnswerOracle::complete): a free-form completion, used by the
//!   template filler and the oracle-guided rewrite
//!
//! This seam keeps the expensive, stochastic part swappable: production runs
//! use the CLI-agent adapter in [`agent`], tests use a deterministic mock.
//! Retry with bounded backoff wraps any oracle via [`retry::Retrying`].

pub mod agent;
pub mod retry;

pub use agent::{Agent, CliOracle};
pub use retry::{Retrying, RetryPolicy};

use crate::error::OracleError;
use crate::types::{AnswerDistribution, Question};

/// Capability interface for the external model.
///
/// Implementations must be `Send + Sync`: within a generation, evaluation work
/// is dispatched concurrently from a bounded worker pool.
pub trait AnswerOracle: Send + Sync {
    /// Answer distribution for `question` when the model is conditioned on
    /// `context` (a full transcript or a filled template).
    fn query(&self, context: &str, question: &Question) -> Result<AnswerDistribution, OracleError>;

    /// Free-form completion for a prompt. Template filling and rewrite
    /// assistance are built on this.
    fn complete(&self, prompt: &str) -> Result<String, OracleError>;
}

// Boxed oracles are oracles too, so callers can hold `Box<dyn AnswerOracle>`.
impl AnswerOracle for Box<dyn AnswerOracle> {
    fn query(&self, context: &str, question: &Question) -> Result<AnswerDistribution, OracleError> {
        (**self).query(context, question)
    }

    fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        (**self).complete(prompt)
    }
}

impl<O: AnswerOracle> AnswerOracle for std::sync::Arc<O> {
    fn query(&self, context: &str, question: &Question) -> Result<AnswerDistribution, OracleError> {
        (**self).query(context, question)
    }

    fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        (**self).complete(prompt)
    }
}

/// Deterministic test oracle shared by unit tests across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    type QueryFn = dyn Fn(&str, &Question) -> Result<AnswerDistribution, OracleError> + Send + Sync;

    /// Scripted oracle: a query closure plus a queue of completions.
    /// Counts every call so caching and budget tests can assert on traffic.
    pub struct MockOracle {
        query_fn: Box<QueryFn>,
        completions: Mutex<VecDeque<Result<String, OracleError>>>,
        pub query_calls: AtomicUsize,
        pub complete_calls: AtomicUsize,
    }

    impl MockOracle {
        pub fn new<F>(query_fn: F) -> Self
        where
            F: Fn(&str, &Question) -> Result<AnswerDistribution, OracleError>
                + Send
                + Sync
                + 'static,
        {
            MockOracle {
                query_fn: Box::new(query_fn),
                completions: Mutex::new(VecDeque::new()),
                query_calls: AtomicUsize::new(0),
                complete_calls: AtomicUsize::new(0),
            }
        }

        /// Oracle that answers every query with a uniform distribution.
        pub fn uniform() -> Self {
            Self::new(|_, q| {
                AnswerDistribution::uniform(q.vocabulary.len())
                    .ok_or_else(|| OracleError::Malformed("empty vocabulary".into()))
            })
        }

        /// Queue a completion result (served FIFO, then falls back to an
        /// empty string).
        pub fn push_completion(&self, result: Result<String, OracleError>) {
            self.completions.lock().unwrap().push_back(result);
        }

        pub fn queries(&self) -> usize {
            self.query_calls.load(Ordering::SeqCst)
        }
    }

    impl AnswerOracle for MockOracle {
        fn query(
            &self,
            context: &str,
            question: &Question,
        ) -> Result<AnswerDistribution, OracleError> {
            self.query_calls.fetch_add(1, Ordering::SeqCst);
            (self.query_fn)(context, question)
        }

        fn complete(&self, _prompt: &str) -> Result<String, OracleError> {
            self.complete_calls.fetch_add(1, Ordering::SeqCst);
            self.completions
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(String::new()))
        }
    }

    #[test]
    fn test_mock_counts_calls() {
        let oracle = MockOracle::uniform();
        let q = Question::likert("q1", "How calm are you?");
        oracle.query("ctx", &q).unwrap();
        oracle.query("ctx", &q).unwrap();
        assert_eq!(oracle.queries(), 2);
    }

    #[test]
    fn test_mock_completion_queue() {
        let oracle = MockOracle::uniform();
        oracle.push_completion(Ok("first".to_string()));
        oracle.push_completion(Err(OracleError::Timeout(1)));
        assert_eq!(oracle.complete("p").unwrap(), "first");
        assert!(oracle.complete("p").is_err());
        assert_eq!(oracle.complete("p").unwrap(), "");
    }
}
