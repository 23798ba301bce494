//! CLI-agent oracle adapter.
//!
//! Shells out to a non-interactive agent CLI and parses structured answers
//! back out of the response text. Supported backends via `--agent`:
//! - `claude` (default): `claude --print -p "prompt"`
//! - `gemini`: `gemini -o text -y "prompt"`
//! - `codex`: `codex exec` with the prompt on stdin
//!
//! Every call runs on a worker thread with a hard deadline; a call that
//! exceeds it yields `OracleError::Timeout` instead of blocking the
//! generation. Stderr is sniffed to classify rate-limit and auth failures so
//! the retry layer can tell transient from permanent.

use std::io::Write;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::mpsc;
use std::time::Duration;

use crate::error::OracleError;
use crate::oracle::AnswerOracle;
use crate::types::{AnswerDistribution, Question};

/// Which LLM agent CLI to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Agent {
    #[default]
    Claude,
    Gemini,
    /// OpenAI Codex CLI
    Codex,
}

impl FromStr for Agent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "claude" => Ok(Agent::Claude),
            "gemini" => Ok(Agent::Gemini),
            "codex" | "openai" => Ok(Agent::Codex),
            _ => Err(format!(
                "Unknown agent: {}. Use 'claude', 'gemini', or 'codex'",
                s
            )),
        }
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Agent::Claude => write!(f, "claude"),
            Agent::Gemini => write!(f, "gemini"),
            Agent::Codex => write!(f, "codex"),
        }
    }
}

/// Oracle adapter backed by an agent CLI subprocess.
#[derive(Debug, Clone)]
pub struct CliOracle {
    pub agent: Agent,
    /// Optional model override (e.g. "opus", "gemini-2.0-flash")
    pub model: Option<String>,
    /// Per-call deadline
    pub timeout_secs: u64,
}

impl CliOracle {
    pub fn new(agent: Agent, model: Option<String>, timeout_secs: u64) -> Self {
        CliOracle {
            agent,
            model,
            timeout_secs,
        }
    }

    /// Run one agent call with the per-call deadline.
    ///
    /// The blocking subprocess runs on a spawned thread; we wait on a channel
    /// with `recv_timeout` so a hung backend costs one worker, not the whole
    /// generation.
    fn call(&self, prompt: &str) -> Result<String, OracleError> {
        let agent = self.agent;
        let model = self.model.clone();
        let prompt = prompt.to_string();
        let (tx, rx) = mpsc::channel();

        std::thread::spawn(move || {
            let result = match agent {
                Agent::Claude => call_claude(&prompt, model.as_deref()),
                Agent::Gemini => call_gemini(&prompt, model.as_deref()),
                Agent::Codex => call_codex(&prompt, model.as_deref()),
            };
            // Receiver may have timed out and gone away; that's fine.
            let _ = tx.send(result);
        });

        match rx.recv_timeout(Duration::from_secs(self.timeout_secs)) {
            Ok(result) => result,
            Err(_) => Err(OracleError::Timeout(self.timeout_secs)),
        }
    }

    /// Build the answer prompt: assume the participant's role, then report a
    /// probability for each allowed answer.
    fn answer_prompt(context: &str, question: &Question) -> String {
        let vocab_list = question.vocabulary.join(", ");
        format!(
            r#"Your task is to parse the following description and pretend to be the person described.
After assuming the role, answer the question below.

Description:
{context}

Question:
{prompt}

The only allowed answers are: {vocab_list}.
Respond with a single JSON object mapping each allowed answer to the probability
that the person described would give it. Probabilities must sum to 1.
Do not add any other text."#,
            context = context,
            prompt = question.prompt,
            vocab_list = vocab_list,
        )
    }
}

impl AnswerOracle for CliOracle {
    fn query(&self, context: &str, question: &Question) -> Result<AnswerDistribution, OracleError> {
        let prompt = Self::answer_prompt(context, question);
        let response = self.call(&prompt)?;
        parse_distribution(&response, &question.vocabulary)
    }

    fn complete(&self, prompt: &str) -> Result<String, OracleError> {
        self.call(prompt)
    }
}

/// Extract the first balanced JSON object from a response.
fn extract_json_block(response: &str) -> Option<&str> {
    let start = response.find('{')?;
    let mut depth = 0;
    for (i, c) in response[start..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&response[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Parse a JSON answer-probability object into a distribution over the
/// vocabulary, in vocabulary order.
fn parse_distribution(
    response: &str,
    vocabulary: &[String],
) -> Result<AnswerDistribution, OracleError> {
    let json_str = extract_json_block(response)
        .ok_or_else(|| OracleError::Malformed("no JSON object in response".to_string()))?;

    let parsed: std::collections::HashMap<String, f64> = serde_json::from_str(json_str)
        .map_err(|e| OracleError::Malformed(format!("bad JSON: {}", e)))?;

    let raw: Vec<f64> = vocabulary
        .iter()
        .map(|v| parsed.get(v).copied().unwrap_or(0.0))
        .collect();

    if raw.iter().all(|p| *p == 0.0) {
        return Err(OracleError::Malformed(format!(
            "response assigns no mass to any vocabulary element: {}",
            json_str
        )));
    }

    AnswerDistribution::from_probs(&raw)
        .ok_or_else(|| OracleError::Malformed("invalid probability values".to_string()))
}

/// Classify a failed CLI invocation by its stderr.
fn classify_failure(stderr: &str) -> OracleError {
    let lower = stderr.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded") {
        OracleError::RateLimited(stderr.trim().to_string())
    } else if lower.contains("unauthorized")
        || lower.contains("api key")
        || lower.contains("401")
        || lower.contains("403")
    {
        OracleError::Auth(stderr.trim().to_string())
    } else {
        OracleError::Unavailable(stderr.trim().to_string())
    }
}

/// `claude --print -p "prompt"` for non-interactive output.
fn call_claude(prompt: &str, model: Option<&str>) -> Result<String, OracleError> {
    let mut cmd = Command::new("claude");
    if let Some(m) = model {
        cmd.args(["--model", m]);
    }
    cmd.args(["--print", "-p", prompt]);

    let output = cmd
        .output()
        .map_err(|e| OracleError::Unavailable(format!("failed to execute claude: {}", e)))?;

    if !output.status.success() {
        return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `gemini -o text -y "prompt"` for non-interactive text output.
fn call_gemini(prompt: &str, model: Option<&str>) -> Result<String, OracleError> {
    let mut cmd = Command::new("gemini");
    cmd.args(["-o", "text", "-y"]);
    if let Some(m) = model {
        cmd.args(["-m", m]);
    }
    cmd.arg(prompt);

    let output = cmd
        .output()
        .map_err(|e| OracleError::Unavailable(format!("failed to execute gemini: {}", e)))?;

    if !output.status.success() {
        return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// `codex exec` with the prompt on stdin and output collected via temp file.
fn call_codex(prompt: &str, model: Option<&str>) -> Result<String, OracleError> {
    let output_file = std::env::temp_dir().join(format!("evoloop_codex_{}.txt", std::process::id()));

    let mut args = vec!["exec".to_string(), "--skip-git-repo-check".to_string()];
    if let Some(m) = model {
        args.push("-m".to_string());
        args.push(m.to_string());
    }
    args.push("-o".to_string());
    args.push(output_file.to_string_lossy().to_string());
    args.push("-".to_string()); // prompt from stdin

    let mut child = Command::new("codex")
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| OracleError::Unavailable(format!("failed to execute codex: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(prompt.as_bytes())
            .map_err(|e| OracleError::Unavailable(format!("codex stdin: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .map_err(|e| OracleError::Unavailable(format!("codex wait: {}", e)))?;

    if !output.status.success() {
        let _ = std::fs::remove_file(&output_file);
        return Err(classify_failure(&String::from_utf8_lossy(&output.stderr)));
    }

    let response = std::fs::read_to_string(&output_file)
        .map_err(|e| OracleError::Malformed(format!("codex output file: {}", e)))?;
    let _ = std::fs::remove_file(&output_file);

    Ok(response.trim().to_string())
}
