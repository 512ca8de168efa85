// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process lineage table.
//!
//! Maps an operating-system process id to the trace that process belongs to and
//! the span currently representing it. The table is shared by every export call
//! served by the router and guarded by a single table-wide read/write lock.
//!
//! Records are never mutated in place: superseding the representative span id
//! replaces the whole record, so a reader holding a clone always sees a
//! consistent `(trace_id, span_id)` pair. Records are never evicted.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockWriteGuard};

use crate::id_generator::TraceId;

pub type ProcessId = u32;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    /// Fixed at creation for the lifetime of the record.
    pub trace_id: TraceId,
    /// Span id of the span currently representing the process, as sent by the producer.
    pub span_id: Vec<u8>,
}

impl ProcessRecord {
    pub fn new(trace_id: TraceId, span_id: Vec<u8>) -> Self {
        ProcessRecord { trace_id, span_id }
    }

    /// Returns a record for the same trace with a new representative span.
    #[must_use]
    pub fn with_span_id(&self, span_id: Vec<u8>) -> Self {
        ProcessRecord {
            trace_id: self.trace_id,
            span_id,
        }
    }
}

#[derive(Debug, Default)]
pub struct LineageTable {
    procs: RwLock<HashMap<ProcessId, ProcessRecord>>,
}

impl LineageTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, pid: ProcessId) -> Option<ProcessRecord> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&pid)
            .cloned()
    }

    pub fn upsert(&self, pid: ProcessId, record: ProcessRecord) {
        self.lock().insert(pid, record);
    }

    pub fn len(&self) -> usize {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes exclusive access to the table until the returned guard is dropped.
    pub fn lock(&self) -> LineageGuard<'_> {
        LineageGuard {
            procs: self.procs.write().unwrap_or_else(PoisonError::into_inner),
        }
    }
}

/// Exclusive view of the lineage table, held for the whole rewrite of one span.
pub struct LineageGuard<'a> {
    procs: RwLockWriteGuard<'a, HashMap<ProcessId, ProcessRecord>>,
}

impl LineageGuard<'_> {
    pub fn get(&self, pid: ProcessId) -> Option<&ProcessRecord> {
        self.procs.get(&pid)
    }

    pub fn insert(&mut self, pid: ProcessId, record: ProcessRecord) {
        match self.procs.get(&pid) {
            // the trace id of a known process never changes
            Some(existing) if existing.trace_id != record.trace_id => {
                let span_id = record.span_id;
                let replacement = existing.with_span_id(span_id);
                self.procs.insert(pid, replacement);
            }
            _ => {
                self.procs.insert(pid, record);
            }
        }
    }
}
