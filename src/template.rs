//! Latent templates as typed slot programs.
//!
//! A template is not a blob of text but an ordered list of typed slots that
//! can be independently mutated by the search. Three slot kinds:
//!
//! - `Percentile`: "You are ___ percentile in {trait}." - numeric blank
//! - `Exemplar`: "This is exemplified by: [FILL IN]" - free-text blank
//! - `FixedLabel`: verbatim scaffold text (e.g. the name line)
//!
//! Templates are immutable once created. Every mutation or oracle rewrite
//! produces a *new* template via [`Template::fork`], carrying parent id and
//! lineage so improvement provenance survives the whole run.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FillError;

/// Blank marker the filler replaces with a numeric percentile.
pub const BLANK_MARKER: &str = "___";
/// Blank marker the filler replaces with free text.
pub const FILL_MARKER: &str = "[FILL IN]";

static PERCENTILE_RE: Lazy<Regex> = Lazy::new(|| {
    // "1. You are ___ percentile in openness." (numbering optional)
    Regex::new(r"(?i)you are\s+_+\s+percentile in\s+([^.\[\]]+?)\s*\.").expect("valid regex")
});

static EXEMPLAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)exemplified by\s*:").expect("valid regex"));

/// Kind of blank a slot carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SlotKind {
    /// Numeric percentile estimate for a latent trait
    Percentile,
    /// Free-text evidence for the preceding trait
    Exemplar,
    /// Fixed scaffold text, filled only for the literal `____` name blank
    FixedLabel,
}

/// One slot of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Slot {
    pub kind: SlotKind,
    /// For `Percentile`/`Exemplar`: the latent trait name.
    /// For `FixedLabel`: the verbatim line.
    pub label: String,
}

impl Slot {
    pub fn percentile(label: impl Into<String>) -> Self {
        Slot {
            kind: SlotKind::Percentile,
            label: label.into(),
        }
    }

    pub fn exemplar(label: impl Into<String>) -> Self {
        Slot {
            kind: SlotKind::Exemplar,
            label: label.into(),
        }
    }

    pub fn fixed(label: impl Into<String>) -> Self {
        Slot {
            kind: SlotKind::FixedLabel,
            label: label.into(),
        }
    }
}

/// Metadata about a template's origin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TemplateMetadata {
    /// Unix timestamp at creation
    pub created_at: i64,
    /// Human-readable description of the mutation that produced it
    pub mutation: String,
    /// Ids of all ancestors, oldest first
    #[serde(default)]
    pub lineage: Vec<String>,
}

/// A latent template: typed slots plus lineage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Unique id, e.g. "latent_007"
    pub id: String,
    /// Direct parent, if forked
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Generation index at creation (0 = seed)
    pub generation: usize,
    /// Ordered slots
    pub slots: Vec<Slot>,
    pub metadata: TemplateMetadata,
}

fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

impl Template {
    pub fn new(id: impl Into<String>, slots: Vec<Slot>) -> Self {
        Template {
            id: id.into(),
            parent_id: None,
            generation: 0,
            slots,
            metadata: TemplateMetadata {
                created_at: now_secs(),
                ..Default::default()
            },
        }
    }

    /// Latent trait names, in slot order (percentile slots only).
    pub fn trait_names(&self) -> Vec<&str> {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Percentile)
            .map(|s| s.label.as_str())
            .collect()
    }

    /// Number of percentile slots.
    pub fn n_traits(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.kind == SlotKind::Percentile)
            .count()
    }

    /// Render the blank template to the text the filler receives.
    ///
    /// Percentile lines are numbered; an exemplar slot renders indented under
    /// the line it supports.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let mut n = 0;
        for slot in &self.slots {
            match slot.kind {
                SlotKind::FixedLabel => {
                    out.push_str(&slot.label);
                    out.push('\n');
                }
                SlotKind::Percentile => {
                    n += 1;
                    out.push_str(&format!(
                        "{}. You are {} percentile in {}.\n",
                        n, BLANK_MARKER, slot.label
                    ));
                }
                SlotKind::Exemplar => {
                    out.push_str(&format!("   This is exemplified by: {}\n", FILL_MARKER));
                }
            }
        }
        out.trim_end().to_string()
    }

    /// Create a child template: fresh id, linked lineage, bumped generation.
    pub fn fork(
        &self,
        new_id: impl Into<String>,
        generation: usize,
        mutation: impl Into<String>,
    ) -> Self {
        let mut lineage = self.metadata.lineage.clone();
        lineage.push(self.id.clone());
        Template {
            id: new_id.into(),
            parent_id: Some(self.id.clone()),
            generation,
            slots: self.slots.clone(),
            metadata: TemplateMetadata {
                created_at: now_secs(),
                mutation: mutation.into(),
                lineage,
            },
        }
    }

    /// Parse a blank template back out of oracle-produced text.
    ///
    /// Recognizes the canonical slot grammar line by line. Returns `None`
    /// when the text contains no percentile slot at all - the caller treats
    /// that as a malformed rewrite and falls back to structured mutation.
    pub fn parse(id: impl Into<String>, generation: usize, text: &str) -> Option<Self> {
        let mut slots = Vec::new();
        let mut last_trait = String::new();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line == "---" {
                continue;
            }
            if let Some(caps) = PERCENTILE_RE.captures(line) {
                let trait_name = caps[1].trim().to_lowercase();
                last_trait = trait_name.clone();
                slots.push(Slot::percentile(trait_name));
                // The original format puts the exemplar on the same line
                if EXEMPLAR_RE.is_match(line) {
                    slots.push(Slot::exemplar(last_trait.clone()));
                }
            } else if EXEMPLAR_RE.is_match(line) {
                slots.push(Slot::exemplar(last_trait.clone()));
            } else {
                slots.push(Slot::fixed(line.to_string()));
            }
        }

        let template = Template {
            id: id.into(),
            parent_id: None,
            generation,
            slots,
            metadata: TemplateMetadata {
                created_at: now_secs(),
                mutation: "parsed from oracle rewrite".to_string(),
                lineage: Vec::new(),
            },
        };

        if template.n_traits() == 0 {
            return None;
        }
        Some(template)
    }

    /// Validate a *filled* rendering of this template.
    ///
    /// Structural check only: every blank must be gone and every trait the
    /// template names must still be present in the filled text.
    pub fn validate_filled(&self, filled: &str) -> std::result::Result<(), FillError> {
        if filled.contains(FILL_MARKER) {
            return Err(FillError::SlotMismatch(format!(
                "unfilled {} marker remains",
                FILL_MARKER
            )));
        }
        if filled.contains(BLANK_MARKER) {
            return Err(FillError::SlotMismatch(
                "unfilled percentile blank remains".to_string(),
            ));
        }
        let lower = filled.to_lowercase();
        for name in self.trait_names() {
            if !lower.contains(&name.to_lowercase()) {
                return Err(FillError::MissingField(format!(
                    "filled text dropped trait '{}'",
                    name
                )));
            }
        }
        Ok(())
    }

    /// Save as TOML (with full metadata) for run persistence.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).context("serialize template")?;
        std::fs::write(path.as_ref(), content)
            .with_context(|| format!("write template to {}", path.as_ref().display()))
    }

    /// Load from a TOML file written by [`save`](Self::save).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("read template from {}", path.as_ref().display()))?;
        toml::from_str(&content).context("parse template TOML")
    }
}

/// The hand-authored seed template: Big Five traits, one percentile +
/// exemplar pair per trait.
pub fn seed_template() -> Template {
    let mut slots = vec![Slot::fixed("Your name is ____ and")];
    for trait_name in [
        "openness",
        "conscientiousness",
        "extraversion",
        "agreeableness",
        "neuroticism",
    ] {
        slots.push(Slot::percentile(trait_name));
        slots.push(Slot::exemplar(trait_name));
    }
    Template::new("latent_000", slots)
}
