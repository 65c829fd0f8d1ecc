//! Idempotency hashing and windowed duplicate suppression.
//!
//! A request hash is SHA-256 over `(sequence name, priority, normalized data)`.
//! Normalization makes structurally identical requests hash identically:
//! - volatile keys (timestamps, re-render markers) are removed at every depth
//! - object keys are sorted
//! - array elements are sorted by their canonical encoding
//!
//! The detector remembers when each hash was last admitted. The orchestrator
//! records a hash immediately after the check passes and before queueing, so
//! two near-simultaneous admissions cannot both pass.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::request::Priority;

/// Keys stripped before hashing.
const VOLATILE_KEYS: [&str; 8] = [
    "timestamp",
    "_timestamp",
    "requestTime",
    "submittedAt",
    "_renderId",
    "_renderCount",
    "_reactKey",
    "__source",
];

/// Generate the idempotency hash for a submission.
pub fn request_hash(sequence_name: &str, priority: Priority, data: &Map<String, Value>) -> String {
    let normalized = normalize(&Value::Object(data.clone()));

    let mut hasher = Sha256::new();
    hasher.update(sequence_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(priority.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(canonical(&normalized).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Strip volatile fields and sort keys and array contents.
pub fn normalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map
                .iter()
                .filter(|(key, _)| !VOLATILE_KEYS.contains(&key.as_str()))
                .collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            let mut out = Map::new();
            for (key, value) in entries {
                out.insert(key.clone(), normalize(value));
            }
            Value::Object(out)
        }
        Value::Array(items) => {
            let mut items: Vec<Value> = items.iter().map(normalize).collect();
            items.sort_by_cached_key(canonical);
            Value::Array(items)
        }
        other => other.clone(),
    }
}

/// Deterministic encoding with keys in sorted order regardless of map backing.
fn canonical(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let body: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", Value::String(k.clone()), canonical(&map[k])))
                .collect();
            format!("{{{}}}", body.join(","))
        }
        Value::Array(items) => {
            let body: Vec<String> = items.iter().map(canonical).collect();
            format!("[{}]", body.join(","))
        }
        other => other.to_string(),
    }
}

/// Result of a duplicate check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DuplicateCheck {
    Fresh,
    Duplicate {
        /// Time since the hash was last admitted.
        since: Duration,
        /// Re-submitted within the strict-mode threshold (double-render heuristic).
        rapid: bool,
    },
}

impl DuplicateCheck {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, DuplicateCheck::Duplicate { .. })
    }
}

/// Windowed hash store.
#[derive(Debug)]
pub struct DuplicateDetector {
    window: Duration,
    strict_threshold: Duration,
    capacity: usize,
    last_seen: HashMap<String, Instant>,
    /// Insertion order for eviction; may hold stale entries for re-recorded hashes.
    order: VecDeque<(String, Instant)>,
}

impl DuplicateDetector {
    pub fn new(window: Duration, strict_threshold: Duration, capacity: usize) -> Self {
        Self {
            window,
            strict_threshold,
            capacity: capacity.max(1),
            last_seen: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn check(&self, hash: &str, now: Instant) -> DuplicateCheck {
        match self.last_seen.get(hash) {
            Some(seen) => {
                let since = now.saturating_duration_since(*seen);
                if since < self.window {
                    DuplicateCheck::Duplicate {
                        since,
                        rapid: since < self.strict_threshold,
                    }
                } else {
                    DuplicateCheck::Fresh
                }
            }
            None => DuplicateCheck::Fresh,
        }
    }

    /// Record a hash as admitted at `now`, evicting the oldest past capacity.
    pub fn record(&mut self, hash: String, now: Instant) {
        self.last_seen.insert(hash.clone(), now);
        self.order.push_back((hash, now));

        while self.last_seen.len() > self.capacity {
            match self.order.pop_front() {
                Some((old, at)) => self.remove_if_current(&old, at),
                None => break,
            }
        }
        // Bound stale bookkeeping from re-recorded hashes too.
        while self.order.len() > self.capacity * 2 {
            if let Some((old, at)) = self.order.pop_front() {
                self.remove_if_current(&old, at);
            }
        }
    }

    /// Forget hashes older than the window. Returns how many were dropped.
    pub fn prune(&mut self, now: Instant) -> usize {
        let before = self.last_seen.len();
        while let Some((_, at)) = self.order.front() {
            if now.saturating_duration_since(*at) < self.window {
                break;
            }
            if let Some((old, at)) = self.order.pop_front() {
                self.remove_if_current(&old, at);
            }
        }
        before - self.last_seen.len()
    }

    pub fn len(&self) -> usize {
        self.last_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.last_seen.clear();
        self.order.clear();
    }

    fn remove_if_current(&mut self, hash: &str, at: Instant) {
        if self.last_seen.get(hash) == Some(&at) {
            self.last_seen.remove(hash);
        }
    }
}
