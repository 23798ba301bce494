//! Run configuration loading from evoloop.toml.
//!
//! A run directory may carry an `evoloop.toml` with any subset of keys;
//! everything missing falls back to defaults, and the CLI can override on
//! top. Keys use kebab-case:
//!
//! ```toml
//! agent = "claude"
//! strategy = "mixed"
//! litter-size = 4
//! max-generations = 20
//! max-oracle-calls = 2000
//! convergence-epsilon = 0.01
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Effective run configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source file for this config (for display)
    pub source: Option<PathBuf>,

    // === Oracle ===
    /// Agent CLI backend: claude, gemini, codex
    pub agent: String,
    /// Optional model override passed to the agent CLI
    pub model: Option<String>,
    /// Per-call deadline
    pub oracle_timeout_secs: u64,
    /// Retry attempts for transient oracle failures (1 = no retries)
    pub retry_max_attempts: u32,
    /// Base backoff delay, doubled per retry
    pub retry_base_delay_ms: u64,

    // === Search ===
    /// Proposal strategy: mutate, rewrite, mixed
    pub strategy: String,
    /// Candidates per breeding step
    pub litter_size: usize,
    /// Elites kept each generation
    pub elite_k: usize,
    /// Exploration parents sampled each generation
    pub explore_k: usize,
    /// Worst/best questions per transcript in rewrite evidence
    pub evidence_k: usize,
    /// Generation budget
    pub max_generations: usize,
    /// Generations without significant improvement before convergence
    pub patience: usize,
    /// Minimum improvement that counts as progress
    pub convergence_epsilon: f64,
    /// Absolute divergence target; reaching it ends the run
    pub target_distance: Option<f64>,
    /// Oracle-call budget for the whole run
    pub max_oracle_calls: Option<usize>,
    /// Consecutive all-failed generations before the run fails
    pub max_barren_generations: usize,
    /// Evaluate at most this many transcripts (cost control)
    pub max_transcripts: Option<usize>,
    /// RNG seed for mutation and selection
    pub seed: u64,
    /// Concurrent oracle calls within a generation
    pub concurrency: usize,

    // === Output ===
    /// Run directory for history, templates, and the answer cache
    pub run_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            source: None,
            agent: "claude".to_string(),
            model: None,
            oracle_timeout_secs: 120,
            retry_max_attempts: 3,
            retry_base_delay_ms: 500,
            strategy: "mixed".to_string(),
            litter_size: 4,
            elite_k: 2,
            explore_k: 1,
            evidence_k: 5,
            max_generations: 10,
            patience: 3,
            convergence_epsilon: 0.01,
            target_distance: None,
            max_oracle_calls: None,
            max_barren_generations: 3,
            max_transcripts: None,
            seed: 42,
            concurrency: 4,
            run_dir: None,
        }
    }
}

/// Raw config as deserialized from TOML.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct RawConfig {
    agent: Option<String>,
    model: Option<String>,
    oracle_timeout_secs: Option<u64>,
    retry_max_attempts: Option<u32>,
    retry_base_delay_ms: Option<u64>,
    strategy: Option<String>,
    litter_size: Option<usize>,
    elite_k: Option<usize>,
    explore_k: Option<usize>,
    evidence_k: Option<usize>,
    max_generations: Option<usize>,
    patience: Option<usize>,
    convergence_epsilon: Option<f64>,
    target_distance: Option<f64>,
    max_oracle_calls: Option<usize>,
    max_barren_generations: Option<usize>,
    max_transcripts: Option<usize>,
    seed: Option<u64>,
    concurrency: Option<usize>,
}

impl Config {
    /// Load configuration from `<directory>/evoloop.toml`, falling back to
    /// defaults when the file is absent.
    pub fn load(directory: &Path) -> Result<Self> {
        let path = directory.join("evoloop.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("read config {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&content)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(Self::from_raw(raw, path))
    }

    fn from_raw(raw: RawConfig, source: PathBuf) -> Self {
        let defaults = Config::default();
        Config {
            source: Some(source),
            agent: raw.agent.unwrap_or(defaults.agent),
            model: raw.model,
            oracle_timeout_secs: raw.oracle_timeout_secs.unwrap_or(defaults.oracle_timeout_secs),
            retry_max_attempts: raw.retry_max_attempts.unwrap_or(defaults.retry_max_attempts),
            retry_base_delay_ms: raw.retry_base_delay_ms.unwrap_or(defaults.retry_base_delay_ms),
            strategy: raw.strategy.unwrap_or(defaults.strategy),
            litter_size: raw.litter_size.unwrap_or(defaults.litter_size),
            elite_k: raw.elite_k.unwrap_or(defaults.elite_k),
            explore_k: raw.explore_k.unwrap_or(defaults.explore_k),
            evidence_k: raw.evidence_k.unwrap_or(defaults.evidence_k),
            max_generations: raw.max_generations.unwrap_or(defaults.max_generations),
            patience: raw.patience.unwrap_or(defaults.patience),
            convergence_epsilon: raw.convergence_epsilon.unwrap_or(defaults.convergence_epsilon),
            target_distance: raw.target_distance,
            max_oracle_calls: raw.max_oracle_calls,
            max_barren_generations: raw
                .max_barren_generations
                .unwrap_or(defaults.max_barren_generations),
            max_transcripts: raw.max_transcripts,
            seed: raw.seed.unwrap_or(defaults.seed),
            concurrency: raw.concurrency.unwrap_or(defaults.concurrency),
            run_dir: None,
        }
    }

    /// Reject configurations the search loop cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.litter_size == 0 {
            bail!("litter-size must be at least 1");
        }
        if self.elite_k == 0 {
            bail!("elite-k must be at least 1");
        }
        if self.max_generations == 0 {
            bail!("max-generations must be at least 1");
        }
        if self.patience == 0 {
            bail!("patience must be at least 1");
        }
        if self.concurrency == 0 {
            bail!("concurrency must be at least 1");
        }
        if self.convergence_epsilon < 0.0 {
            bail!("convergence-epsilon must be non-negative");
        }
        self.strategy
            .parse::<crate::generate::Strategy>()
            .map_err(|e| anyhow::anyhow!(e))?;
        self.agent
            .parse::<crate::oracle::Agent>()
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(())
    }

    /// Format for verbose display.
    pub fn display_summary(&self) -> String {
        let mut lines = Vec::new();
        match &self.source {
            Some(source) => lines.push(format!("   Config: {}", source.display())),
            None => lines.push("   Config: (defaults)".to_string()),
        }
        lines.push(format!("   Agent: {} (timeout {}s)", self.agent, self.oracle_timeout_secs));
        lines.push(format!(
            "   Search: {} strategy, litter {}, elites {}, explore {}",
            self.strategy, self.litter_size, self.elite_k, self.explore_k
        ));
        lines.push(format!(
            "   Budget: {} generations, {} oracle calls",
            self.max_generations,
            self.max_oracle_calls
                .map(|c| c.to_string())
                .unwrap_or_else(|| "unlimited".to_string()),
        ));
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.agent, "claude");
        assert_eq!(config.strategy, "mixed");
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let dir = std::env::temp_dir().join(format!("evoloop_cfg_none_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = Config::load(&dir).unwrap();
        assert!(config.source.is_none());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_load_partial_toml() {
        let dir = std::env::temp_dir().join(format!("evoloop_cfg_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join("evoloop.toml"),
            "agent = \"gemini\"\nlitter-size = 8\nmax-oracle-calls = 500\n",
        )
        .unwrap();

        let config = Config::load(&dir).unwrap();
        assert_eq!(config.agent, "gemini");
        assert_eq!(config.litter_size, 8);
        assert_eq!(config.max_oracle_calls, Some(500));
        // Untouched keys keep defaults
        assert_eq!(config.elite_k, 2);
        assert!(config.validate().is_ok());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.litter_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.strategy = "genetic".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.agent = "gpt9".to_string();
        assert!(config.validate().is_err());
    }
}
