// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Trace and span identifier generation.
//!
//! Identifiers come from the operating system CSPRNG. When the entropy source
//! fails, the generator degrades to a timestamp-based identifier instead of
//! returning an error: the current UNIX time in nanoseconds is written
//! little-endian into the leading 8 bytes and the remaining bytes are zeroed.
//! Fallback stamps are strictly monotonic per generator, so two fallbacks in
//! the same nanosecond still produce distinct identifiers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::OsRng;
use rand::TryRngCore;
use tracing::warn;

pub const TRACE_ID_LEN: usize = 16;
pub const SPAN_ID_LEN: usize = 8;

/// 16-byte identifier shared by every span of one process tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TraceId([u8; TRACE_ID_LEN]);

impl TraceId {
    pub const fn from_bytes(bytes: [u8; TRACE_ID_LEN]) -> Self {
        TraceId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TRACE_ID_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// 8-byte identifier of a single span.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SpanId([u8; SPAN_ID_LEN]);

impl SpanId {
    pub const fn from_bytes(bytes: [u8; SPAN_ID_LEN]) -> Self {
        SpanId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; SPAN_ID_LEN] {
        &self.0
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Produces trace and span identifiers from a fallible entropy source.
pub struct IdGenerator<R = OsRng> {
    rng: Mutex<R>,
    last_fallback_nanos: AtomicU64,
}

impl IdGenerator<OsRng> {
    pub fn new() -> Self {
        Self::with_rng(OsRng)
    }
}

impl Default for IdGenerator<OsRng> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: TryRngCore> IdGenerator<R> {
    pub fn with_rng(rng: R) -> Self {
        IdGenerator {
            rng: Mutex::new(rng),
            last_fallback_nanos: AtomicU64::new(0),
        }
    }

    pub fn new_trace_id(&self) -> TraceId {
        let mut id = [0u8; TRACE_ID_LEN];
        self.fill(&mut id, "trace");
        TraceId(id)
    }

    pub fn new_span_id(&self) -> SpanId {
        let mut id = [0u8; SPAN_ID_LEN];
        self.fill(&mut id, "span");
        SpanId(id)
    }

    fn fill(&self, dest: &mut [u8], kind: &str) {
        let result = match self.rng.lock() {
            Ok(mut rng) => rng.try_fill_bytes(dest).map_err(|e| format!("{e:?}")),
            Err(_) => Err("entropy source lock poisoned".to_string()),
        };

        if let Err(err) = result {
            let stamp = self.next_fallback_stamp();
            warn!("Entropy source unavailable ({err}), using timestamp {kind} id {stamp}");
            dest.fill(0);
            dest[..8].copy_from_slice(&stamp.to_le_bytes());
        }
    }

    fn next_fallback_stamp(&self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        // the closure never returns None, so both arms carry the previous value
        let previous = match self.last_fallback_nanos.fetch_update(
            Ordering::SeqCst,
            Ordering::SeqCst,
            |last| Some(now.max(last.saturating_add(1))),
        ) {
            Ok(prev) | Err(prev) => prev,
        };
        now.max(previous.saturating_add(1))
    }
}
