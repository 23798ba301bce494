//! evoloop: evolutionary latent-template search driver.
//!
//! ## Usage
//!
//! ```bash
//! # Search with defaults (claude backend, mixed strategy)
//! evoloop --transcripts data/transcripts.json --questions data/questions.json
//!
//! # Bounded run with a named output directory
//! evoloop --transcripts t.json --questions q.json \
//!     --run-name pilot --generations 20 --budget 2000
//!
//! # Resume a run from its checkpoints
//! evoloop --transcripts t.json --questions q.json --run-name pilot --resume
//! ```
//!
//! ## Input formats
//!
//! `transcripts.json`: array of `{ "id": "...", "text": "..." }`.
//! `questions.json`: `{ "instructions": "...", "questions": [ { "id": "...",
//! "prompt": "...", "vocabulary": ["1", ... ] } ], "weights": { "id": 2.0 } }`
//! - `vocabulary` defaults to the 1-5 Likert scale, `weights` to 1.0.
//!
//! ## Run directory
//!
//! ```text
//! runs/<run-name>/
//!   config.toml      # effective configuration snapshot
//!   history.json     # append-only evaluation records + generation summaries
//!   answers.redb     # persistent oracle answer cache
//!   templates/       # every candidate, as TOML with lineage metadata
//!   best.toml        # best-found template
//!   best.md          # its rendered text
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::OwoColorize;

use evoloop::search::load_templates;
use evoloop::{
    seed_template, Agent, CliOracle, Config, OracleFiller, QuestionSet, RetryPolicy, Retrying,
    RunHistory, SearchController, Template, Transcript,
};

#[derive(Parser)]
#[command(name = "evoloop")]
#[command(about = "Evolutionary search for latent templates that mimic transcript-conditioned model behavior")]
struct Args {
    /// Path to transcripts JSON (array of {id, text})
    #[arg(long)]
    transcripts: PathBuf,

    /// Path to question set JSON
    #[arg(long)]
    questions: PathBuf,

    /// Name for this run (directory under --base-dir)
    #[arg(long, default_value = "run")]
    run_name: String,

    /// Base directory for run outputs
    #[arg(long, default_value = "runs")]
    base_dir: PathBuf,

    /// Seed template TOML files (defaults to the built-in Big Five seed)
    #[arg(long)]
    template: Vec<PathBuf>,

    /// Agent CLI to use (claude, gemini, codex)
    #[arg(long)]
    agent: Option<String>,

    /// Model override passed to the agent CLI
    #[arg(long)]
    model: Option<String>,

    /// Proposal strategy (mutate, rewrite, mixed)
    #[arg(long)]
    strategy: Option<String>,

    /// Generation budget
    #[arg(long)]
    generations: Option<usize>,

    /// Oracle-call budget for the whole run
    #[arg(long)]
    budget: Option<usize>,

    /// Candidates per breeding step
    #[arg(long)]
    litter: Option<usize>,

    /// Concurrent oracle calls
    #[arg(long)]
    concurrency: Option<usize>,

    /// Evaluate at most this many transcripts
    #[arg(long)]
    max_transcripts: Option<usize>,

    /// Absolute divergence target; stop when reached
    #[arg(long)]
    target: Option<f64>,

    /// RNG seed
    #[arg(long)]
    seed: Option<u64>,

    /// Resume from the run directory's checkpoints
    #[arg(long)]
    resume: bool,
}

fn load_transcripts(path: &PathBuf) -> Result<Vec<Transcript>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read transcripts from {}", path.display()))?;
    serde_json::from_str(&content).context("parse transcripts JSON")
}

fn load_questions(path: &PathBuf) -> Result<QuestionSet> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("read questions from {}", path.display()))?;
    serde_json::from_str(&content).context("parse question set JSON")
}

fn load_seeds(paths: &[PathBuf]) -> Result<Vec<Template>> {
    if paths.is_empty() {
        return Ok(vec![seed_template()]);
    }
    paths.iter().map(|p| Template::load(p)).collect()
}

/// Merge CLI overrides on top of the file-loaded configuration.
fn effective_config(args: &Args, run_dir: PathBuf) -> Result<Config> {
    let mut config = Config::load(&std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))?;

    if let Some(agent) = &args.agent {
        config.agent = agent.clone();
    }
    if args.model.is_some() {
        config.model = args.model.clone();
    }
    if let Some(strategy) = &args.strategy {
        config.strategy = strategy.clone();
    }
    if let Some(generations) = args.generations {
        config.max_generations = generations;
    }
    if args.budget.is_some() {
        config.max_oracle_calls = args.budget;
    }
    if let Some(litter) = args.litter {
        config.litter_size = litter;
    }
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.max_transcripts.is_some() {
        config.max_transcripts = args.max_transcripts;
    }
    if args.target.is_some() {
        config.target_distance = args.target;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }
    config.run_dir = Some(run_dir);
    config.validate()?;
    Ok(config)
}

/// Snapshot the effective configuration into the run directory.
fn save_config_snapshot(config: &Config, run_dir: &PathBuf) -> Result<()> {
    let content = format!(
        r#"# evoloop run configuration (snapshot)
agent = "{}"
strategy = "{}"
litter-size = {}
elite-k = {}
explore-k = {}
max-generations = {}
patience = {}
convergence-epsilon = {}
seed = {}
concurrency = {}
{}{}"#,
        config.agent,
        config.strategy,
        config.litter_size,
        config.elite_k,
        config.explore_k,
        config.max_generations,
        config.patience,
        config.convergence_epsilon,
        config.seed,
        config.concurrency,
        config
            .max_oracle_calls
            .map(|c| format!("max-oracle-calls = {}\n", c))
            .unwrap_or_default(),
        config
            .target_distance
            .map(|t| format!("target-distance = {}\n", t))
            .unwrap_or_default(),
    );
    std::fs::write(run_dir.join("config.toml"), content).context("write config snapshot")
}

fn main() -> Result<()> {
    let args = Args::parse();

    println!();
    println!("{}", " EVOLOOP LATENT TEMPLATE SEARCH ".bold().on_magenta());
    println!();

    let run_dir = args.base_dir.join(&args.run_name);
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("create run directory {}", run_dir.display()))?;

    let config = effective_config(&args, run_dir.clone())?;
    let transcripts = load_transcripts(&args.transcripts)?;
    let questions = load_questions(&args.questions)?;
    let seeds = load_seeds(&args.template)?;

    println!("Configuration:");
    println!("{}", config.display_summary());
    println!("   Transcripts: {}", transcripts.len());
    println!("   Questions: {}", questions.len());
    println!("   Run dir: {}", run_dir.display());
    println!();

    save_config_snapshot(&config, &run_dir)?;

    // Oracle + filler share the backend but retry independently
    let agent: Agent = config.agent.parse().map_err(|e: String| anyhow::anyhow!(e))?;
    let policy = RetryPolicy {
        max_attempts: config.retry_max_attempts,
        base_delay_ms: config.retry_base_delay_ms,
    };
    let backend = CliOracle::new(agent, config.model.clone(), config.oracle_timeout_secs);
    let oracle = Retrying::new(backend.clone(), policy);
    let filler = OracleFiller::new(Retrying::new(backend, policy));

    let mut controller =
        SearchController::new(oracle, filler, config, questions, transcripts, seeds)?;

    if args.resume {
        let history_path = run_dir.join("history.json");
        if history_path.exists() {
            println!("{}", "Resuming from existing checkpoints...".dimmed());
            let history = RunHistory::load(&history_path)?;
            let templates = load_templates(&run_dir)?;
            controller = controller.with_resumed_state(history, templates);
        }
    }

    println!("{}", "─".repeat(65));
    let result = controller.run()?;
    println!("{}", "─".repeat(65));

    match result.outcome {
        evoloop::RunOutcome::Converged => {
            println!("{}", " SEARCH CONVERGED ".bold().on_green())
        }
        evoloop::RunOutcome::Exhausted => {
            println!("{}", " BUDGET EXHAUSTED ".bold().on_yellow())
        }
        evoloop::RunOutcome::Failed => println!("{}", " SEARCH FAILED ".bold().on_red()),
    }
    println!();

    if let (Some(template), Some(record)) = (&result.best_template, &result.best_record) {
        println!(
            "Best template: {} (divergence {:.4} ± {:.4} over {} transcripts)",
            template.id.bold(),
            record.aggregate.unwrap_or(f64::NAN),
            record.std_err,
            record.per_transcript.len(),
        );
        if let Some(parent) = &template.parent_id {
            println!("  parent: {}  mutation: {}", parent, template.metadata.mutation);
        }
        println!();
        println!("{}", template.render());
    } else {
        println!("No candidate could be evaluated; see history for failures.");
    }

    #[cfg(feature = "plotters")]
    {
        let chart = run_dir.join("progress.png");
        match controller.progress().export_png(&chart) {
            Ok(()) => println!("Progress chart: {}", chart.display()),
            Err(err) => eprintln!("warning: could not write progress chart: {}", err),
        }
    }

    println!();
    println!("Outputs saved to: {}", run_dir.display());

    Ok(())
}
