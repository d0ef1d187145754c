//! Reconciliation primitives.
//!
//! This library provides the pure building blocks used by the BMC
//! reconciliation engines. Key concepts:
//!
//! - **Remote state**: What the aggregation service reports.
//! - **Local state**: What the resource store records as intent.
//! - **Drift**: Any difference between the two, resolved per policy.
//!
//! # Invariants
//!
//! - All helpers are deterministic given the same inputs
//! - Set differences never invent elements absent from their first operand

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

/// Per-key set difference.
///
/// For every key present in `a`, returns the elements of `a[key]` that are
/// not in `b[key]`. A key missing from `b` means every element of `a[key]`
/// is new. Keys whose difference is empty are omitted, so the result is
/// empty iff `a` is a per-key subset of `b`.
///
/// The operation is asymmetric: `diff_keyed_sets(remote, local)` yields what
/// appeared remotely, `diff_keyed_sets(local, remote)` what disappeared.
pub fn diff_keyed_sets<K, V>(
    a: &BTreeMap<K, BTreeSet<V>>,
    b: &BTreeMap<K, BTreeSet<V>>,
) -> BTreeMap<K, BTreeSet<V>>
where
    K: Ord + Clone,
    V: Ord + Clone,
{
    let mut out = BTreeMap::new();

    for (key, a_ids) in a {
        let missing: BTreeSet<V> = match b.get(key) {
            Some(b_ids) => a_ids.difference(b_ids).cloned().collect(),
            None => a_ids.clone(),
        };

        if !missing.is_empty() {
            out.insert(key.clone(), missing);
        }
    }

    out
}

/// Merge `extra` into `base`, key by key.
///
/// Used to fold an accommodate outcome back into local state.
pub fn union_keyed_sets<K, V>(
    base: &BTreeMap<K, BTreeSet<V>>,
    extra: &BTreeMap<K, BTreeSet<V>>,
) -> BTreeMap<K, BTreeSet<V>>
where
    K: Ord + Clone,
    V: Ord + Clone,
{
    let mut out = base.clone();
    for (key, ids) in extra {
        out.entry(key.clone())
            .or_default()
            .extend(ids.iter().cloned());
    }
    out
}

/// Total number of elements across all keys.
pub fn keyed_len<K, V>(sets: &BTreeMap<K, BTreeSet<V>>) -> usize {
    sets.values().map(BTreeSet::len).sum()
}

/// A snapshot hash for deterministic comparison.
///
/// Used to detect when BIOS or boot attributes have changed, independent of
/// key ordering in the remote response.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a snapshot hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("sha256:{}", hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Retry tracker for operations that may never complete.
///
/// A BMC whose add workflow keeps failing is removed once its attempts are
/// exhausted instead of lingering in a pending state.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    /// Maximum attempts per resource.
    max_attempts: u32,

    /// Retry window duration.
    window: Duration,

    /// Tracked failures: resource_key -> (count, first_failure_time).
    failures: BTreeMap<String, (u32, Instant)>,
}

impl RetryTracker {
    /// Create a new retry tracker.
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
            failures: BTreeMap::new(),
        }
    }

    /// Record a failure for a resource.
    ///
    /// Returns true once the resource has used up its attempts.
    pub fn record_failure(&mut self, resource_key: &str) -> bool {
        let now = Instant::now();

        let (count, first) = self
            .failures
            .entry(resource_key.to_string())
            .or_insert((0, now));

        // Reset if outside window
        if now.duration_since(*first) > self.window {
            *count = 0;
            *first = now;
        }

        *count = count.saturating_add(1);
        *count >= self.max_attempts
    }

    /// Check if attempts are exhausted for a resource.
    pub fn is_exhausted(&self, resource_key: &str) -> bool {
        let Some((count, first)) = self.failures.get(resource_key) else {
            return false;
        };

        if Instant::now().duration_since(*first) > self.window {
            return false;
        }

        *count >= self.max_attempts
    }

    /// Number of failures currently counted for a resource.
    pub fn failures(&self, resource_key: &str) -> u32 {
        self.failures.get(resource_key).map_or(0, |(count, _)| *count)
    }

    /// Clear failure tracking for a resource (on success).
    pub fn clear(&mut self, resource_key: &str) {
        self.failures.remove(resource_key);
    }

    /// Prune expired entries.
    pub fn prune(&mut self) {
        let now = Instant::now();
        self.failures
            .retain(|_, (_, first)| now.duration_since(*first) <= self.window);
    }
}

/// Default interval between full reconciliation passes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Default number of add attempts before an uncompletable BMC is removed.
pub const DEFAULT_MAX_ADD_ATTEMPTS: u32 = 3;

/// Default retry window.
pub const DEFAULT_RETRY_WINDOW: Duration = Duration::from_secs(60 * 60);

#[cfg(test)]
mod tests {
    use super::*;

    fn sets(entries: &[(&str, &[u32])]) -> BTreeMap<String, BTreeSet<u32>> {
        entries
            .iter()
            .map(|(k, ids)| (k.to_string(), ids.iter().copied().collect()))
            .collect()
    }

    #[test]
    fn test_diff_new_remote_volume() {
        let remote = sets(&[("ArrayControllers-0", &[1, 2, 3])]);
        let local = sets(&[("ArrayControllers-0", &[1, 2])]);

        assert_eq!(
            diff_keyed_sets(&remote, &local),
            sets(&[("ArrayControllers-0", &[3])])
        );
        assert!(diff_keyed_sets(&local, &remote).is_empty());
    }

    #[test]
    fn test_diff_missing_key_means_all_new() {
        let remote = sets(&[("c0", &[1]), ("c1", &[7, 8])]);
        let local = sets(&[("c0", &[1])]);

        assert_eq!(diff_keyed_sets(&remote, &local), sets(&[("c1", &[7, 8])]));
    }

    #[test]
    fn test_diff_omits_empty_keys() {
        let a = sets(&[("c0", &[])]);
        let b = BTreeMap::new();
        assert!(diff_keyed_sets(&a, &b).is_empty());
    }

    #[test]
    fn test_union_then_diff_is_empty() {
        let remote = sets(&[("c0", &[1, 2, 3]), ("c1", &[4])]);
        let local = sets(&[("c0", &[1])]);

        let created = diff_keyed_sets(&remote, &local);
        let merged = union_keyed_sets(&local, &created);
        assert!(diff_keyed_sets(&remote, &merged).is_empty());
        assert_eq!(keyed_len(&created), 3);
    }

    #[test]
    fn test_spec_hash_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        let hash1 = SpecHash::from_json(&json1);
        let hash2 = SpecHash::from_json(&json2);

        assert_eq!(hash1, hash2);
        assert!(hash1.as_str().starts_with("sha256:"));
    }

    #[test]
    fn test_spec_hash_detects_change() {
        let before = serde_json::json!({"BootMode": "Uefi"});
        let after = serde_json::json!({"BootMode": "LegacyBios"});
        assert_ne!(SpecHash::from_json(&before), SpecHash::from_json(&after));
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new(3, Duration::from_secs(60));

        assert!(!tracker.record_failure("bmc-1")); // 1st
        assert!(!tracker.record_failure("bmc-1")); // 2nd
        assert!(tracker.record_failure("bmc-1")); // 3rd - exhausted

        assert!(tracker.is_exhausted("bmc-1"));
        assert!(!tracker.is_exhausted("bmc-2"));
        assert_eq!(tracker.failures("bmc-1"), 3);

        tracker.clear("bmc-1");
        assert!(!tracker.is_exhausted("bmc-1"));
    }
}
