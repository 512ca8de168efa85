// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;

use regex::Regex;
use serde::Deserialize;
use serde_yaml::{Mapping, Value};

use super::condition::Condition;
use super::SigmaError;
use crate::detection::{Event, RuleMatch};

/// Detection keys that configure the rule rather than name a search.
const RESERVED_DETECTION_KEYS: [&str; 2] = ["condition", "timeframe"];

#[derive(Deserialize)]
struct RawRule {
    title: String,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    level: Option<String>,
    detection: Mapping,
}

/// A compiled Sigma rule.
#[derive(Debug)]
pub struct Rule {
    pub title: String,
    pub id: Option<String>,
    pub level: Option<String>,
    /// File the rule was loaded from, if any.
    pub path: Option<PathBuf>,
    searches: Vec<(String, Search)>,
    conditions: Vec<Condition>,
}

impl Rule {
    pub fn from_yaml(source: &str) -> Result<Rule, SigmaError> {
        // multi-document files carry the rule in their first document
        let document = serde_yaml::Deserializer::from_str(source)
            .next()
            .ok_or_else(|| SigmaError::InvalidRule("empty document".to_string()))?;
        let raw = RawRule::deserialize(document)?;
        Self::compile(raw)
    }

    fn compile(raw: RawRule) -> Result<Rule, SigmaError> {
        let mut searches = Vec::new();
        let mut condition_value = None;
        for (key, value) in &raw.detection {
            let key = key
                .as_str()
                .ok_or_else(|| SigmaError::InvalidRule("non-string detection key".to_string()))?;
            if key == "condition" {
                condition_value = Some(value);
            } else if !RESERVED_DETECTION_KEYS.contains(&key) {
                let search = Search::compile(value)
                    .map_err(|e| SigmaError::InvalidSearch(key.to_string(), Box::new(e)))?;
                searches.push((key.to_string(), search));
            }
        }

        let names: Vec<String> = searches.iter().map(|(name, _)| name.clone()).collect();
        let expressions: Vec<&str> = match condition_value {
            Some(Value::String(expr)) => vec![expr.as_str()],
            Some(Value::Sequence(list)) => list
                .iter()
                .map(|v| {
                    v.as_str().ok_or_else(|| {
                        SigmaError::InvalidRule("condition list must hold strings".to_string())
                    })
                })
                .collect::<Result<_, _>>()?,
            _ => return Err(SigmaError::MissingCondition),
        };
        let conditions = expressions
            .into_iter()
            .map(|expr| Condition::parse(expr, &names))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Rule {
            title: raw.title,
            id: raw.id,
            level: raw.level,
            path: None,
            searches,
            conditions,
        })
    }

    /// A list of conditions matches when any of them does.
    pub fn matches(&self, event: &Event) -> bool {
        let is_match = |name: &str| {
            self.searches
                .iter()
                .find(|(search_name, _)| search_name == name)
                .is_some_and(|(_, search)| search.matches(event))
        };
        self.conditions.iter().any(|c| c.eval(&is_match))
    }

    pub fn to_match(&self) -> RuleMatch {
        RuleMatch {
            title: self.title.clone(),
            id: self.id.clone(),
            level: self.level.clone(),
        }
    }
}

#[derive(Debug)]
enum Search {
    /// Every field matcher must match.
    All(Vec<FieldMatcher>),
    /// Any of the maps must match.
    AnyOf(Vec<Vec<FieldMatcher>>),
    /// Full-text keywords. Attribute events carry no keywords, so these never match.
    Keywords,
}

impl Search {
    fn compile(value: &Value) -> Result<Search, SigmaError> {
        match value {
            Value::Mapping(map) => Ok(Search::All(compile_map(map)?)),
            Value::Sequence(items) if !items.is_empty() && items.iter().all(Value::is_mapping) => {
                let maps = items
                    .iter()
                    .filter_map(Value::as_mapping)
                    .map(compile_map)
                    .collect::<Result<_, _>>()?;
                Ok(Search::AnyOf(maps))
            }
            Value::Sequence(_) | Value::String(_) | Value::Number(_) => Ok(Search::Keywords),
            _ => Err(SigmaError::InvalidRule(
                "search must be a map, a list of maps or a keyword list".to_string(),
            )),
        }
    }

    fn matches(&self, event: &Event) -> bool {
        match self {
            Search::All(matchers) => matchers.iter().all(|m| m.matches(event)),
            Search::AnyOf(maps) => maps
                .iter()
                .any(|matchers| matchers.iter().all(|m| m.matches(event))),
            Search::Keywords => false,
        }
    }
}

fn compile_map(map: &Mapping) -> Result<Vec<FieldMatcher>, SigmaError> {
    map.iter()
        .map(|(key, value)| {
            let key = key
                .as_str()
                .ok_or_else(|| SigmaError::InvalidRule("non-string field name".to_string()))?;
            FieldMatcher::compile(key, value)
        })
        .collect()
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MatchKind {
    Equals,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
}

#[derive(Debug)]
struct FieldMatcher {
    field: String,
    patterns: Vec<Pattern>,
    require_all: bool,
}

impl FieldMatcher {
    fn compile(key: &str, value: &Value) -> Result<FieldMatcher, SigmaError> {
        let mut parts = key.split('|');
        let field = parts.next().unwrap_or_default().to_string();

        let mut kind = MatchKind::Equals;
        let mut require_all = false;
        let mut windash = false;
        for modifier in parts {
            match modifier {
                "contains" => kind = MatchKind::Contains,
                "startswith" => kind = MatchKind::StartsWith,
                "endswith" => kind = MatchKind::EndsWith,
                "re" => kind = MatchKind::Regex,
                "all" => require_all = true,
                "windash" => windash = true,
                other => return Err(SigmaError::UnsupportedModifier(other.to_string())),
            }
        }

        let values: Vec<String> = match value {
            Value::Null => {
                return Ok(FieldMatcher {
                    field,
                    patterns: vec![Pattern::Absent],
                    require_all: false,
                })
            }
            Value::Sequence(items) => items.iter().map(scalar_to_string).collect::<Result<_, _>>()?,
            scalar => vec![scalar_to_string(scalar)?],
        };

        let mut patterns = Vec::with_capacity(values.len());
        for value in values {
            if kind == MatchKind::Regex {
                patterns.push(Pattern::Regex(Regex::new(&value)?));
                continue;
            }
            let variants = if windash {
                windash_variants(&value)
            } else {
                vec![value]
            };
            let mut compiled = variants
                .iter()
                .map(|v| Pattern::compile(kind, v))
                .collect::<Result<Vec<_>, _>>()?;
            patterns.push(if compiled.len() == 1 {
                compiled.remove(0)
            } else {
                Pattern::AnyOf(compiled)
            });
        }

        Ok(FieldMatcher {
            field,
            patterns,
            require_all,
        })
    }

    fn matches(&self, event: &Event) -> bool {
        let value = event.get(&self.field).map(ToString::to_string);
        let lowered = value.as_deref().map(str::to_lowercase);
        let hit = |p: &Pattern| p.matches(value.as_deref(), lowered.as_deref());
        if self.require_all {
            self.patterns.iter().all(hit)
        } else {
            self.patterns.iter().any(hit)
        }
    }
}

#[derive(Debug)]
enum Pattern {
    /// The field is missing or empty.
    Absent,
    Exact(String),
    Contains(String),
    StartsWith(String),
    EndsWith(String),
    /// Wildcard pattern compiled to a case-insensitive anchored regex.
    Glob(Regex),
    /// `|re` modifier: case-sensitive, unanchored.
    Regex(Regex),
    AnyOf(Vec<Pattern>),
}

impl Pattern {
    fn compile(kind: MatchKind, value: &str) -> Result<Pattern, SigmaError> {
        let mut tokens = glob_tokens(value);
        match kind {
            MatchKind::Contains => {
                tokens.insert(0, GlobToken::AnyMany);
                tokens.push(GlobToken::AnyMany);
            }
            MatchKind::StartsWith => tokens.push(GlobToken::AnyMany),
            MatchKind::EndsWith => tokens.insert(0, GlobToken::AnyMany),
            MatchKind::Equals | MatchKind::Regex => {}
        }

        let leading = matches!(tokens.first(), Some(GlobToken::AnyMany));
        let trailing = tokens.len() > 1 && matches!(tokens.last(), Some(GlobToken::AnyMany));
        let inner = &tokens[usize::from(leading)..tokens.len() - usize::from(trailing)];
        if let Some(literal) = literal_text(inner) {
            let literal = literal.to_lowercase();
            return Ok(match (leading, trailing) {
                (false, false) => Pattern::Exact(literal),
                (true, true) => Pattern::Contains(literal),
                (false, true) => Pattern::StartsWith(literal),
                (true, false) => Pattern::EndsWith(literal),
            });
        }

        let mut source = String::from("(?is)^");
        for token in &tokens {
            match token {
                GlobToken::Literal(c) => source.push_str(&regex::escape(&c.to_string())),
                GlobToken::AnyMany => source.push_str(".*"),
                GlobToken::AnyOne => source.push('.'),
            }
        }
        source.push('$');
        Ok(Pattern::Glob(Regex::new(&source)?))
    }

    fn matches(&self, value: Option<&str>, lowered: Option<&str>) -> bool {
        match self {
            Pattern::Absent => value.map_or(true, str::is_empty),
            Pattern::Regex(re) => value.is_some_and(|v| re.is_match(v)),
            Pattern::Glob(re) => value.is_some_and(|v| re.is_match(v)),
            Pattern::Exact(s) => lowered.is_some_and(|v| v == s),
            Pattern::Contains(s) => lowered.is_some_and(|v| v.contains(s.as_str())),
            Pattern::StartsWith(s) => lowered.is_some_and(|v| v.starts_with(s.as_str())),
            Pattern::EndsWith(s) => lowered.is_some_and(|v| v.ends_with(s.as_str())),
            Pattern::AnyOf(patterns) => patterns.iter().any(|p| p.matches(value, lowered)),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum GlobToken {
    Literal(char),
    AnyMany,
    AnyOne,
}

/// Splits a Sigma value into literals and wildcards. `\*`, `\?` and `\\`
/// escape the following character; any other backslash is literal.
fn glob_tokens(value: &str) -> Vec<GlobToken> {
    let mut tokens = Vec::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => match chars.peek() {
                Some(&next @ ('*' | '?' | '\\')) => {
                    chars.next();
                    tokens.push(GlobToken::Literal(next));
                }
                _ => tokens.push(GlobToken::Literal('\\')),
            },
            '*' => tokens.push(GlobToken::AnyMany),
            '?' => tokens.push(GlobToken::AnyOne),
            c => tokens.push(GlobToken::Literal(c)),
        }
    }
    tokens
}

fn literal_text(tokens: &[GlobToken]) -> Option<String> {
    tokens
        .iter()
        .map(|t| match t {
            GlobToken::Literal(c) => Some(*c),
            _ => None,
        })
        .collect()
}

/// Command-line flag spellings Windows accepts interchangeably with `-`.
fn windash_variants(value: &str) -> Vec<String> {
    let mut variants = vec![value.to_string()];
    for dash in ['/', '\u{2013}', '\u{2014}', '\u{2015}'] {
        let variant = value.replace('-', &dash.to_string());
        if !variants.contains(&variant) {
            variants.push(variant);
        }
    }
    variants
}

fn scalar_to_string(value: &Value) -> Result<String, SigmaError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(SigmaError::InvalidRule(
            "field values must be scalars".to_string(),
        )),
    }
}
