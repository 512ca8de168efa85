// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Detection gate: annotates spans whose attributes match a known signature.
//!
//! The gate never drops or delays a span and never touches lineage state. A
//! rule engine failure is logged and treated as "no match".

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
use opentelemetry_proto::tonic::trace::v1::{status::StatusCode, Span, Status};
use tracing::warn;

pub const ALERT_ATTRIBUTE_KEY: &str = "sigma.alert";
pub const ALERT_STATUS_MESSAGE: &str = "Sigma rule matched";

/// Attribute value kinds a rule can inspect.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventValue {
    String(String),
    Int(i64),
    Bool(bool),
}

impl fmt::Display for EventValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventValue::String(s) => f.write_str(s),
            EventValue::Int(i) => write!(f, "{i}"),
            EventValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

/// Flat key/value view of a span's attributes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Event {
    fields: BTreeMap<String, EventValue>,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds the view from string, integer and boolean attributes. Other value
    /// kinds are left out of the view; a repeated key keeps its last value.
    pub fn from_attributes(attributes: &[KeyValue]) -> Self {
        let fields = attributes
            .iter()
            .filter_map(|kv| {
                let value = match kv.value.as_ref()?.value.as_ref()? {
                    any_value::Value::StringValue(s) => EventValue::String(s.clone()),
                    any_value::Value::IntValue(i) => EventValue::Int(*i),
                    any_value::Value::BoolValue(b) => EventValue::Bool(*b),
                    _ => return None,
                };
                Some((kv.key.clone(), value))
            })
            .collect();
        Event { fields }
    }

    pub fn insert(&mut self, key: impl Into<String>, value: EventValue) {
        self.fields.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&EventValue> {
        self.fields.get(key)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleMatch {
    pub title: String,
    pub id: Option<String>,
    pub level: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum DetectionError {
    #[error("Rule evaluation failed: {0}")]
    Evaluation(String),
}

pub trait RuleEngine {
    /// Evaluates every rule against the event, returning matches in the
    /// engine's deterministic order.
    fn evaluate_all(&self, event: &Event) -> Result<Vec<RuleMatch>, DetectionError>;
}

pub struct DetectionGate {
    engine: Arc<dyn RuleEngine + Send + Sync>,
}

impl DetectionGate {
    pub fn new(engine: Arc<dyn RuleEngine + Send + Sync>) -> Self {
        DetectionGate { engine }
    }

    /// Marks the span as an alert when a rule matches and returns that rule.
    pub fn inspect(&self, span: &mut Span) -> Option<RuleMatch> {
        let event = Event::from_attributes(&span.attributes);
        let matched = match self.engine.evaluate_all(&event) {
            Ok(matches) => matches.into_iter().next()?,
            Err(err) => {
                warn!("Detection skipped for span {}: {err}", hex_id(&span.span_id));
                return None;
            }
        };

        span.attributes.push(KeyValue {
            key: ALERT_ATTRIBUTE_KEY.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(matched.title.clone())),
            }),
        });
        span.status = Some(Status {
            code: StatusCode::Error as i32,
            message: ALERT_STATUS_MESSAGE.to_string(),
        });
        warn!(
            "Sigma rule matched trace={} span={} rule={:?}",
            hex_id(&span.trace_id),
            hex_id(&span.span_id),
            matched.title
        );
        Some(matched)
    }
}

fn hex_id(id: &[u8]) -> String {
    hex::encode(id)
}
