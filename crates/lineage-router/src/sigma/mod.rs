// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sigma rule engine.
//!
//! Loads a directory of Sigma rules and evaluates them against flat attribute
//! events. Only the parts of Sigma needed to evaluate process-creation style
//! rules are implemented:
//!
//! - searches as maps (AND), lists of maps (OR) or keyword lists (never match,
//!   attribute events carry no keywords);
//! - field modifiers `contains`, `startswith`, `endswith`, `all`, `re` and
//!   `windash`, with case-insensitive `*`/`?` wildcard matching;
//! - conditions with `and`, `or`, `not`, parentheses and `1 of`/`any of`/`all of`.
//!
//! Rules using aggregations or other modifiers are skipped and counted as
//! unsupported; rules that fail to parse are skipped and counted as failed.

pub mod condition;
pub mod rule;

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::detection::{DetectionError, Event, RuleEngine, RuleMatch};
pub use rule::Rule;

#[derive(Debug, thiserror::Error)]
pub enum SigmaError {
    #[error("Rules directory {} does not exist or is not a directory", .0.display())]
    RulesDirectory(PathBuf),

    #[error("Error reading rule file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid rule YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Rule has no detection condition")]
    MissingCondition,

    #[error("Invalid search {0}: {1}")]
    InvalidSearch(String, Box<SigmaError>),

    #[error("Invalid condition {0:?}: {1}")]
    InvalidCondition(String, String),

    #[error("Condition references unknown search {0}")]
    UnknownSearch(String),

    #[error("Unsupported modifier {0}")]
    UnsupportedModifier(String),

    #[error("Unsupported condition: {0}")]
    UnsupportedCondition(String),

    #[error("Invalid regular expression: {0}")]
    Regex(#[from] regex::Error),
}

impl SigmaError {
    /// True when the rule is valid Sigma that this engine cannot evaluate.
    pub fn is_unsupported(&self) -> bool {
        match self {
            SigmaError::UnsupportedModifier(_) | SigmaError::UnsupportedCondition(_) => true,
            SigmaError::InvalidSearch(_, inner) => inner.is_unsupported(),
            _ => false,
        }
    }
}

/// Rules loaded from disk, evaluated in load order.
#[derive(Debug, Default)]
pub struct Ruleset {
    rules: Vec<Rule>,
    failed: usize,
    unsupported: usize,
}

impl Ruleset {
    pub fn from_rules(rules: Vec<Rule>) -> Self {
        Ruleset {
            rules,
            ..Default::default()
        }
    }

    /// Loads every `.yml`/`.yaml` file under `dir`, recursively and in path order.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Ruleset, SigmaError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(SigmaError::RulesDirectory(dir.to_path_buf()));
        }

        let mut ruleset = Ruleset::default();
        for entry in WalkDir::new(dir).sort_by_file_name() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!("Skipping unreadable entry in rules directory: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_rule_file(entry.path()) {
                continue;
            }

            match load_rule_file(entry.path()) {
                Ok(rule) => ruleset.rules.push(rule),
                Err(e) if e.is_unsupported() => {
                    debug!("Skipping unsupported rule {}: {e}", entry.path().display());
                    ruleset.unsupported += 1;
                }
                Err(e) => {
                    debug!("Skipping invalid rule {}: {e}", entry.path().display());
                    ruleset.failed += 1;
                }
            }
        }
        Ok(ruleset)
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    pub fn unsupported(&self) -> usize {
        self.unsupported
    }
}

impl RuleEngine for Ruleset {
    fn evaluate_all(&self, event: &Event) -> Result<Vec<RuleMatch>, DetectionError> {
        Ok(self
            .rules
            .iter()
            .filter(|rule| rule.matches(event))
            .map(Rule::to_match)
            .collect())
    }
}

fn is_rule_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml" | "yaml")
    )
}

fn load_rule_file(path: &Path) -> Result<Rule, SigmaError> {
    let source = fs::read_to_string(path).map_err(|source| SigmaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let mut rule = Rule::from_yaml(&source)?;
    rule.path = Some(path.to_path_buf());
    Ok(rule)
}

/// Case-sensitive `*`/`?` glob match, used for search identifier patterns.
pub(crate) fn wildcard_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();
    let (mut p, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            backtrack = Some((p, t));
            p += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            t = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
