// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sigma `detection.condition` expressions.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! expr    := and ("or" and)*
//! and     := not ("and" not)*
//! not     := "not" not | primary
//! primary := "(" expr ")" | quant "of" target | identifier
//! quant   := "1" | "any" | "all"
//! target  := "them" | identifier-pattern
//! ```
//!
//! Aggregations (`| count() > n` and friends) are not supported.

use super::{wildcard_match, SigmaError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Condition {
    Search(String),
    Not(Box<Condition>),
    And(Vec<Condition>),
    Or(Vec<Condition>),
    /// At least one of the named searches matches.
    AnyOf(Vec<String>),
    /// Every named search matches.
    AllOf(Vec<String>),
}

impl Condition {
    /// Parses `expression`, resolving identifiers against the rule's search names.
    pub fn parse(expression: &str, searches: &[String]) -> Result<Condition, SigmaError> {
        if expression.contains('|') {
            return Err(SigmaError::UnsupportedCondition(format!(
                "aggregation in {expression:?}"
            )));
        }
        let tokens = tokenize(expression);
        if tokens.is_empty() {
            return Err(SigmaError::InvalidCondition(
                expression.to_string(),
                "empty condition".to_string(),
            ));
        }

        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
            searches,
        };
        let condition = parser.parse_or()?;
        if let Some(token) = parser.peek() {
            return Err(parser.error(&format!("unexpected token {token:?}")));
        }
        Ok(condition)
    }

    pub fn eval(&self, is_match: &dyn Fn(&str) -> bool) -> bool {
        match self {
            Condition::Search(name) => is_match(name),
            Condition::Not(inner) => !inner.eval(is_match),
            Condition::And(all) => all.iter().all(|c| c.eval(is_match)),
            Condition::Or(any) => any.iter().any(|c| c.eval(is_match)),
            Condition::AnyOf(names) => names.iter().any(|n| is_match(n)),
            Condition::AllOf(names) => names.iter().all(|n| is_match(n)),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    Word(String),
}

fn tokenize(expression: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut word = String::new();
    for ch in expression.chars() {
        match ch {
            '(' | ')' => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
                tokens.push(if ch == '(' { Token::Open } else { Token::Close });
            }
            c if c.is_whitespace() => {
                if !word.is_empty() {
                    tokens.push(Token::Word(std::mem::take(&mut word)));
                }
            }
            c => word.push(c),
        }
    }
    if !word.is_empty() {
        tokens.push(Token::Word(word));
    }
    tokens
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    searches: &'a [String],
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_keyword(&self, keyword: &str) -> bool {
        matches!(self.peek(), Some(Token::Word(w)) if w.eq_ignore_ascii_case(keyword))
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn error(&self, reason: &str) -> SigmaError {
        SigmaError::InvalidCondition(self.expression.to_string(), reason.to_string())
    }

    fn parse_or(&mut self) -> Result<Condition, SigmaError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek_keyword("or") {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, SigmaError> {
        let mut terms = vec![self.parse_not()?];
        while self.peek_keyword("and") {
            self.pos += 1;
            terms.push(self.parse_not()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::And(terms)
        })
    }

    fn parse_not(&mut self) -> Result<Condition, SigmaError> {
        if self.peek_keyword("not") {
            self.pos += 1;
            return Ok(Condition::Not(Box::new(self.parse_not()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, SigmaError> {
        match self.next() {
            Some(Token::Open) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(self.error("missing closing parenthesis")),
                }
            }
            Some(Token::Close) => Err(self.error("unexpected closing parenthesis")),
            Some(Token::Word(word)) => {
                let quantifier = word.to_ascii_lowercase();
                if matches!(quantifier.as_str(), "1" | "any" | "all") && self.peek_keyword("of") {
                    self.pos += 1;
                    let names = self.parse_target()?;
                    return Ok(if quantifier == "all" {
                        Condition::AllOf(names)
                    } else {
                        Condition::AnyOf(names)
                    });
                }
                if is_operator(&quantifier) {
                    return Err(self.error(&format!("unexpected operator {word:?}")));
                }
                if !self.searches.iter().any(|s| *s == word) {
                    return Err(SigmaError::UnknownSearch(word));
                }
                Ok(Condition::Search(word))
            }
            None => Err(self.error("unexpected end of condition")),
        }
    }

    fn parse_target(&mut self) -> Result<Vec<String>, SigmaError> {
        let target = match self.next() {
            Some(Token::Word(word)) => word,
            _ => return Err(self.error("expected search pattern after 'of'")),
        };
        let names: Vec<String> = if target.eq_ignore_ascii_case("them") {
            self.searches
                .iter()
                .filter(|s| !s.starts_with('_'))
                .cloned()
                .collect()
        } else {
            self.searches
                .iter()
                .filter(|s| wildcard_match(&target, s))
                .cloned()
                .collect()
        };
        if names.is_empty() {
            return Err(SigmaError::UnknownSearch(target));
        }
        Ok(names)
    }
}

fn is_operator(word: &str) -> bool {
    matches!(word, "and" | "or" | "not" | "of")
}
