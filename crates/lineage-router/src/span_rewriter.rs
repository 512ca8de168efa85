// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Rebuilds trace identity for process telemetry.
//!
//! Producers emit one span per observed process event but rarely know the
//! trace of the parent process. The rewriter infers it online: every span is
//! attributed to a subject process id (and optionally a parent process id) and
//! the [`LineageTable`] is consulted to place the span in the trace of its
//! process tree.
//!
//! Per span, under exclusive access to the table:
//! 1. a span named `process:<pid>` is the canonical start event of its process;
//! 2. an unseen process joins its parent's trace when the parent is known,
//!    otherwise it starts a new trace (a span without an id gets one);
//! 3. a canonical start event becomes the representative span of its process;
//! 4. the span's parent is the representative span of its parent process;
//! 5. the span takes its process's trace id.
//!
//! A child observed before its parent starts its own trace and is never
//! reconciled afterwards. Rewriting is not idempotent for canonical start
//! events: re-processing one moves the representative span of its process.

use std::sync::Arc;

use opentelemetry_proto::tonic::common::v1::{any_value, KeyValue};
use opentelemetry_proto::tonic::trace::v1::Span;
use tracing::debug;

use crate::id_generator::{IdGenerator, TraceId};
use crate::lineage::{LineageTable, ProcessId, ProcessRecord};

pub const PROCESS_SPAN_PREFIX: &str = "process:";
pub const PID_ATTRIBUTE_KEYS: [&str; 3] = ["sysmon.pid", "pid", "ProcessId"];
pub const PPID_ATTRIBUTE_KEYS: [&str; 2] = ["ParentProcessId", "sysmon.ppid"];

/// What the rewriter decided for one attributed span.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Rewrite {
    pub pid: ProcessId,
    pub ppid: Option<ProcessId>,
    pub is_root: bool,
    pub trace_id: TraceId,
    pub parent_linked: bool,
}

pub struct SpanRewriter {
    table: Arc<LineageTable>,
    ids: Arc<IdGenerator>,
}

impl SpanRewriter {
    pub fn new(table: Arc<LineageTable>, ids: Arc<IdGenerator>) -> Self {
        SpanRewriter { table, ids }
    }

    pub fn table(&self) -> &Arc<LineageTable> {
        &self.table
    }

    /// Assigns the span's trace id and parent span id from process lineage.
    ///
    /// Returns `None` and leaves the span untouched when no subject process id
    /// can be resolved.
    pub fn rewrite(&self, span: &mut Span) -> Option<Rewrite> {
        let pid = extract_pid(span)?;
        let ppid = extract_ppid(span);
        let is_root = is_process_start(&span.name);

        let mut procs = self.table.lock();

        let mut record = match procs.get(pid) {
            Some(existing) => existing.clone(),
            None => {
                let trace_id = match ppid.and_then(|ppid| procs.get(ppid)) {
                    Some(parent) => parent.trace_id,
                    None => self.ids.new_trace_id(),
                };
                if span.span_id.is_empty() {
                    span.span_id = self.ids.new_span_id().to_vec();
                }
                let created = ProcessRecord::new(trace_id, span.span_id.clone());
                procs.insert(pid, created.clone());
                created
            }
        };

        if is_root {
            record = record.with_span_id(span.span_id.clone());
            procs.insert(pid, record.clone());
        }

        let mut parent_linked = false;
        if let Some(ppid) = ppid.filter(|ppid| *ppid != pid) {
            if let Some(parent) = procs.get(ppid) {
                span.parent_span_id = parent.span_id.clone();
                parent_linked = true;
            }
        }
        span.trace_id = record.trace_id.to_vec();
        drop(procs);

        debug!(
            "rewrite pid={pid} ppid={} trace={}",
            ppid.unwrap_or_default(),
            record.trace_id
        );

        Some(Rewrite {
            pid,
            ppid,
            is_root,
            trace_id: record.trace_id,
            parent_linked,
        })
    }
}

pub fn is_process_start(name: &str) -> bool {
    name.starts_with(PROCESS_SPAN_PREFIX)
}

/// Subject process id, from a `process:<pid>` span name or the pid attributes.
pub fn extract_pid(span: &Span) -> Option<ProcessId> {
    let from_name = span
        .name
        .strip_prefix(PROCESS_SPAN_PREFIX)
        .and_then(|pid| pid.parse::<ProcessId>().ok());
    from_name
        .or_else(|| extract_int_attr(&span.attributes, &PID_ATTRIBUTE_KEYS))
        .filter(|pid| *pid != 0)
}

pub fn extract_ppid(span: &Span) -> Option<ProcessId> {
    extract_int_attr(&span.attributes, &PPID_ATTRIBUTE_KEYS).filter(|ppid| *ppid != 0)
}

/// First attribute, in attribute order, whose key is one of `keys` and whose
/// value is an integer or an integer-parsable string.
fn extract_int_attr(attributes: &[KeyValue], keys: &[&str]) -> Option<ProcessId> {
    attributes
        .iter()
        .filter(|kv| keys.contains(&kv.key.as_str()))
        .find_map(|kv| match kv.value.as_ref()?.value.as_ref()? {
            any_value::Value::StringValue(s) => s.parse::<ProcessId>().ok(),
            any_value::Value::IntValue(i) => ProcessId::try_from(*i).ok(),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use duplicate::duplicate_item;
    use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, KeyValue};
    use opentelemetry_proto::tonic::trace::v1::Span;

    use super::{extract_pid, extract_ppid, is_process_start, SpanRewriter};
    use crate::id_generator::IdGenerator;
    use crate::lineage::LineageTable;

    fn int_attr(key: &str, value: i64) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::IntValue(value)),
            }),
        }
    }

    fn str_attr(key: &str, value: &str) -> KeyValue {
        KeyValue {
            key: key.to_string(),
            value: Some(AnyValue {
                value: Some(any_value::Value::StringValue(value.to_string())),
            }),
        }
    }

    fn span(name: &str, attributes: Vec<KeyValue>) -> Span {
        Span {
            name: name.to_string(),
            attributes,
            ..Default::default()
        }
    }

    fn rewriter() -> SpanRewriter {
        SpanRewriter::new(Arc::new(LineageTable::new()), Arc::new(IdGenerator::new()))
    }

    #[duplicate_item(
        test_name                           span_name           attrs                                                   expected;
        [test_pid_from_process_name]        ["process:100"]     [vec![]]                                                [Some(100)];
        [test_pid_name_takes_precedence]    ["process:100"]     [vec![int_attr("sysmon.pid", 7)]]                       [Some(100)];
        [test_pid_bad_name_falls_back]      ["process:abc"]     [vec![int_attr("pid", 7)]]                              [Some(7)];
        [test_pid_from_sysmon_attr]         ["event"]           [vec![int_attr("sysmon.pid", 101)]]                     [Some(101)];
        [test_pid_from_string_attr]         ["event"]           [vec![str_attr("ProcessId", "55")]]                     [Some(55)];
        [test_pid_skips_unparsable_attr]    ["event"]           [vec![str_attr("pid", "n/a"), int_attr("ProcessId", 9)]] [Some(9)];
        [test_pid_zero_is_absent]           ["event"]           [vec![int_attr("pid", 0)]]                              [None];
        [test_pid_negative_is_absent]       ["event"]           [vec![int_attr("pid", -4)]]                             [None];
        [test_pid_missing]                  ["event"]           [vec![str_attr("Image", "cmd.exe")]]                    [None];
    )]
    #[test]
    fn test_name() {
        assert_eq!(extract_pid(&span(span_name, attrs)), expected);
    }

    #[test]
    fn test_ppid_extraction() {
        let s = span(
            "event",
            vec![int_attr("sysmon.ppid", 3), str_attr("ParentProcessId", "4")],
        );
        assert_eq!(extract_ppid(&s), Some(3));
        assert_eq!(extract_ppid(&span("event", vec![])), None);
    }

    #[test]
    fn test_is_process_start() {
        assert!(is_process_start("process:1"));
        assert!(is_process_start("process:"));
        assert!(!is_process_start("event"));
        assert!(!is_process_start("subprocess:1"));
    }

    #[test]
    fn test_unattributable_span_passes_through() {
        let rewriter = rewriter();
        let mut s = span("event", vec![str_attr("Image", "cmd.exe")]);
        s.span_id = vec![1; 8];
        let before = s.clone();

        assert!(rewriter.rewrite(&mut s).is_none());
        assert_eq!(s, before);
        assert!(rewriter.table().is_empty());
    }

    #[test]
    fn test_first_process_span_starts_trace() {
        let rewriter = rewriter();
        let mut s = span("process:100", vec![]);

        let rewrite = rewriter.rewrite(&mut s).unwrap();

        assert!(rewrite.is_root);
        assert_eq!(s.trace_id.len(), 16);
        assert_eq!(s.span_id.len(), 8);
        assert!(s.parent_span_id.is_empty());
        assert_eq!(s.trace_id, rewrite.trace_id.to_vec());
    }

    #[test]
    fn test_child_after_parent_joins_parent_trace() {
        let rewriter = rewriter();
        let mut parent = span("process:100", vec![]);
        rewriter.rewrite(&mut parent).unwrap();

        let mut child = span(
            "event",
            vec![int_attr("ParentProcessId", 100), int_attr("sysmon.pid", 101)],
        );
        let rewrite = rewriter.rewrite(&mut child).unwrap();

        assert_eq!(child.trace_id, parent.trace_id);
        assert_eq!(child.parent_span_id, parent.span_id);
        assert!(rewrite.parent_linked);
        assert!(!rewrite.is_root);
    }

    #[test]
    fn test_child_before_parent_keeps_own_trace() {
        let rewriter = rewriter();
        let mut child = span(
            "event",
            vec![int_attr("ParentProcessId", 100), int_attr("sysmon.pid", 101)],
        );
        rewriter.rewrite(&mut child).unwrap();
        let child_trace = child.trace_id.clone();
        assert!(child.parent_span_id.is_empty());

        let mut parent = span("process:100", vec![]);
        rewriter.rewrite(&mut parent).unwrap();
        assert_ne!(parent.trace_id, child_trace);

        let mut later = span("event2", vec![int_attr("sysmon.pid", 101)]);
        rewriter.rewrite(&mut later).unwrap();
        assert_eq!(later.trace_id, child_trace);
    }

    #[test]
    fn test_trace_id_never_changes_for_a_process() {
        let rewriter = rewriter();
        let mut first = span("event", vec![int_attr("pid", 200)]);
        rewriter.rewrite(&mut first).unwrap();

        let mut root = span("process:200", vec![int_attr("ParentProcessId", 1)]);
        rewriter.rewrite(&mut root).unwrap();
        let mut other = span("event", vec![int_attr("pid", 200)]);
        rewriter.rewrite(&mut other).unwrap();

        assert_eq!(root.trace_id, first.trace_id);
        assert_eq!(other.trace_id, first.trace_id);
    }

    #[test]
    fn test_root_span_supersedes_provisional_representative() {
        let rewriter = rewriter();
        let mut provisional = span("event", vec![int_attr("pid", 300)]);
        provisional.span_id = vec![1; 8];
        rewriter.rewrite(&mut provisional).unwrap();

        let mut root = span("process:300", vec![]);
        root.span_id = vec![2; 8];
        rewriter.rewrite(&mut root).unwrap();

        let mut child = span("event", vec![int_attr("pid", 301), int_attr("ParentProcessId", 300)]);
        rewriter.rewrite(&mut child).unwrap();
        assert_eq!(child.parent_span_id, vec![2; 8]);
    }

    #[test]
    fn test_existing_span_id_is_kept() {
        let rewriter = rewriter();
        let mut s = span("process:400", vec![]);
        s.span_id = vec![9; 8];
        rewriter.rewrite(&mut s).unwrap();
        assert_eq!(s.span_id, vec![9; 8]);
        assert_eq!(rewriter.table().lookup(400).unwrap().span_id, vec![9; 8]);
    }

    #[test]
    fn test_self_parent_is_ignored() {
        let rewriter = rewriter();
        let mut first = span("process:500", vec![]);
        rewriter.rewrite(&mut first).unwrap();

        let mut s = span("event", vec![int_attr("pid", 500), int_attr("ParentProcessId", 500)]);
        let rewrite = rewriter.rewrite(&mut s).unwrap();
        assert!(s.parent_span_id.is_empty());
        assert!(!rewrite.parent_linked);
    }

    #[test]
    fn test_rewriting_non_root_span_twice_is_stable() {
        let rewriter = rewriter();
        let mut parent = span("process:600", vec![]);
        rewriter.rewrite(&mut parent).unwrap();

        let mut child = span("event", vec![int_attr("pid", 601), int_attr("ParentProcessId", 600)]);
        rewriter.rewrite(&mut child).unwrap();
        let once = child.clone();
        rewriter.rewrite(&mut child).unwrap();
        assert_eq!(child, once);
        assert_eq!(rewriter.table().len(), 2);
    }

    #[test]
    fn test_rewriting_root_span_twice_moves_representative() {
        let rewriter = rewriter();
        let mut root = span("process:700", vec![]);
        root.span_id = vec![1; 8];
        rewriter.rewrite(&mut root).unwrap();

        let mut replay = root.clone();
        replay.span_id = vec![2; 8];
        rewriter.rewrite(&mut replay).unwrap();
        assert_eq!(rewriter.table().lookup(700).unwrap().span_id, vec![2; 8]);
    }

    #[test]
    fn test_concurrent_disjoint_pids() {
        let rewriter = Arc::new(rewriter());
        let handles: Vec<_> = (0..8u32)
            .map(|worker| {
                let rewriter = Arc::clone(&rewriter);
                thread::spawn(move || {
                    for i in 1..=250u32 {
                        let pid = worker * 10_000 + i;
                        let mut root = span(&format!("process:{pid}"), vec![]);
                        rewriter.rewrite(&mut root).unwrap();
                        let mut child = span(
                            "event",
                            vec![
                                int_attr("pid", i64::from(pid) + 5_000),
                                int_attr("ParentProcessId", i64::from(pid)),
                            ],
                        );
                        rewriter.rewrite(&mut child).unwrap();
                        assert_eq!(child.trace_id, root.trace_id);
                        assert_eq!(child.parent_span_id, root.span_id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let table = rewriter.table();
        assert_eq!(table.len(), 8 * 250 * 2);
        for worker in 0..8u32 {
            for i in 1..=250u32 {
                let pid = worker * 10_000 + i;
                let root = table.lookup(pid).unwrap();
                let child = table.lookup(pid + 5_000).unwrap();
                assert_eq!(root.trace_id, child.trace_id);
            }
        }
    }
}
