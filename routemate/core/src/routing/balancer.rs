//! Replica Load Balancing
//!
//! Strategies for choosing one replica out of the healthy candidates:
//!
//! - [`RoundRobinBalancer`]: strict rotation over the candidates
//! - [`RandomBalancer`]: uniform random choice
//! - [`WeightedRoundRobinBalancer`]: rotation over a virtual distribution
//!   in which each key occupies `weight` consecutive slots
//!
//! ```text
//! weights {A:3, B:1}  ──►  slots [A, A, A, B]
//!
//! counter 0 ─► slot 0 ─► A
//! counter 1 ─► slot 1 ─► A
//! counter 2 ─► slot 2 ─► A
//! counter 3 ─► slot 3 ─► B
//! ```
//!
//! The slots are never materialized: a slot is mapped to its key by walking
//! the cumulative weights, so weights are unbounded.
//!
//! All strategies return `None` only for an empty candidate list. Counters
//! are advanced with a single compare-and-swap, so concurrent callers never
//! observe the same value.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Counter value at which rotation counters restart near zero
pub const COUNTER_RESET_THRESHOLD: u64 = 1_000_000_000;

// ============================================================================
// LoadBalancer Trait
// ============================================================================

/// Chooses one key out of an ordered list of healthy candidates
pub trait LoadBalancer: Send + Sync + fmt::Debug {
    /// Pick a candidate. Returns `None` iff `candidates` is empty.
    fn select(&self, candidates: &[String]) -> Option<String>;

    /// Refresh per-key weights. Weightless strategies ignore this.
    fn update_weights(&self, _weights: &WeightTable) {}

    /// The strategy this balancer implements
    fn strategy(&self) -> Strategy;
}

/// Advance `counter` by one and return the value it held before.
///
/// Once the counter reaches [`COUNTER_RESET_THRESHOLD`] it restarts at the
/// position right after the one just issued, so rotation continues without
/// skipping a key.
fn advance(counter: &AtomicU64, modulus: u64) -> u64 {
    let modulus = modulus.max(1);
    match counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |prev| {
        Some(if prev >= COUNTER_RESET_THRESHOLD {
            prev % modulus + 1
        } else {
            prev + 1
        })
    }) {
        Ok(prev) | Err(prev) => prev,
    }
}

fn pick(candidates: &[String], counter: u64) -> String {
    candidates[(counter % candidates.len() as u64) as usize].clone()
}

// ============================================================================
// Strategy Selector
// ============================================================================

/// Load-balancing strategy selector
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Strict rotation
    #[default]
    RoundRobin,
    /// Uniform random choice
    Random,
    /// Rotation proportional to configured weights
    WeightedRoundRobin,
}

impl Strategy {
    /// Configuration name of the strategy
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::WeightedRoundRobin => "weighted-round-robin",
        }
    }

    /// Build a fresh balancer for this strategy
    #[must_use]
    pub fn build(self, weights: &WeightTable) -> Arc<dyn LoadBalancer> {
        match self {
            Self::RoundRobin => Arc::new(RoundRobinBalancer::new()),
            Self::Random => Arc::new(RandomBalancer::new()),
            Self::WeightedRoundRobin => Arc::new(WeightedRoundRobinBalancer::new(weights)),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognized strategy name
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown load balance strategy '{0}' (expected round-robin, random or weighted-round-robin)")]
pub struct UnknownStrategy(pub String);

impl FromStr for Strategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "round-robin" => Ok(Self::RoundRobin),
            "random" => Ok(Self::Random),
            "weighted-round-robin" => Ok(Self::WeightedRoundRobin),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

// ============================================================================
// Weight Table
// ============================================================================

/// Ordered replica key to weight mapping. Weights are always at least 1.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WeightTable {
    entries: Vec<(String, u64)>,
}

impl WeightTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table from `(key, weight)` pairs in order
    pub fn from_pairs<K, I>(pairs: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, i64)>,
    {
        let mut table = Self::new();
        for (key, weight) in pairs {
            table.insert(key, weight);
        }
        table
    }

    /// Coerce a configured weight to at least 1
    #[must_use]
    pub fn normalize(weight: i64) -> u64 {
        weight.max(1).unsigned_abs()
    }

    /// Set the weight for `key`. Existing keys keep their position.
    pub fn insert(&mut self, key: impl Into<String>, weight: i64) {
        let key = key.into();
        let weight = Self::normalize(weight);
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = weight,
            None => self.entries.push((key, weight)),
        }
    }

    /// Remove `key`, returning its weight
    pub fn remove(&mut self, key: &str) -> Option<u64> {
        let pos = self.entries.iter().position(|(k, _)| k == key)?;
        Some(self.entries.remove(pos).1)
    }

    /// Weight for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<u64> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, w)| *w)
    }

    /// Whether `key` has a weight
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Entries in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|(k, w)| (k.as_str(), *w))
    }

    /// Number of keys
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of all weights, saturating at `u64::MAX`
    #[must_use]
    pub fn total_weight(&self) -> u64 {
        self.entries
            .iter()
            .fold(0u64, |total, (_, w)| total.saturating_add(*w))
    }

    /// Index of the entry owning `slot` in the virtual distribution
    fn entry_at(&self, slot: u64) -> Option<usize> {
        let mut end = 0u64;
        for (idx, (_, weight)) in self.entries.iter().enumerate() {
            end = end.saturating_add(*weight);
            if slot < end {
                return Some(idx);
            }
        }
        None
    }
}

// ============================================================================
// Round Robin
// ============================================================================

/// Strict rotation over the candidate list
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    /// Create a balancer starting at the first candidate
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a balancer whose counter starts at `counter`
    #[must_use]
    pub fn starting_at(counter: u64) -> Self {
        Self {
            counter: AtomicU64::new(counter),
        }
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let counter = advance(&self.counter, candidates.len() as u64);
        Some(pick(candidates, counter))
    }

    fn strategy(&self) -> Strategy {
        Strategy::RoundRobin
    }
}

// ============================================================================
// Random
// ============================================================================

/// Uniform random choice over the candidate list
#[derive(Debug, Default)]
pub struct RandomBalancer;

impl RandomBalancer {
    /// Create a random balancer
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl LoadBalancer for RandomBalancer {
    fn select(&self, candidates: &[String]) -> Option<String> {
        match candidates {
            [] => None,
            [only] => Some(only.clone()),
            _ => {
                let idx = rand::thread_rng().gen_range(0..candidates.len());
                Some(candidates[idx].clone())
            }
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::Random
    }
}

// ============================================================================
// Weighted Round Robin
// ============================================================================

/// Rotation over the slots of a [`WeightTable`]
#[derive(Debug)]
pub struct WeightedRoundRobinBalancer {
    weights: ArcSwap<WeightTable>,
    index: AtomicU64,
}

impl WeightedRoundRobinBalancer {
    /// Create a balancer from the given weights
    #[must_use]
    pub fn new(weights: &WeightTable) -> Self {
        Self {
            weights: ArcSwap::from_pointee(weights.clone()),
            index: AtomicU64::new(0),
        }
    }

    /// Weights currently in effect
    #[must_use]
    pub fn weights(&self) -> Arc<WeightTable> {
        self.weights.load_full()
    }
}

impl LoadBalancer for WeightedRoundRobinBalancer {
    fn select(&self, candidates: &[String]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }

        let weights = self.weights.load();
        let total = weights.total_weight();
        let modulus = if total > 0 { total } else { candidates.len() as u64 };
        let counter = advance(&self.index, modulus);

        // Scan forward from the owning entry; later slots of the same entry
        // hold the same key, so stepping per entry is equivalent.
        if let Some(start) = weights.entry_at(counter % modulus) {
            let len = weights.entries.len();
            let hit = (0..len)
                .map(|offset| &weights.entries[(start + offset) % len].0)
                .find(|key| candidates.contains(key));
            if let Some(key) = hit {
                return Some(key.clone());
            }
        }

        // Configured keys and healthy keys diverged: plain rotation
        Some(pick(candidates, counter))
    }

    fn update_weights(&self, weights: &WeightTable) {
        self.weights.store(Arc::new(weights.clone()));
        self.index.store(0, Ordering::Release);
    }

    fn strategy(&self) -> Strategy {
        Strategy::WeightedRoundRobin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn run(balancer: &dyn LoadBalancer, candidates: &[String], n: usize) -> Vec<String> {
        (0..n).filter_map(|_| balancer.select(candidates)).collect()
    }

    fn counts(picks: &[String]) -> HashMap<String, usize> {
        let mut map = HashMap::new();
        for key in picks {
            *map.entry(key.clone()).or_insert(0) += 1;
        }
        map
    }

    #[test]
    fn test_round_robin_order() {
        let rr = RoundRobinBalancer::new();
        let abc = keys(&["A", "B", "C"]);
        assert_eq!(run(&rr, &abc, 4), keys(&["A", "B", "C", "A"]));
    }

    #[test]
    fn test_round_robin_fairness() {
        let rr = RoundRobinBalancer::new();
        let abc = keys(&["A", "B", "C"]);
        let tally = counts(&run(&rr, &abc, 100));

        let min = tally.values().min().copied().unwrap_or(0);
        let max = tally.values().max().copied().unwrap_or(0);
        assert_eq!(tally.values().sum::<usize>(), 100);
        assert!(max - min <= 1, "unfair distribution: {tally:?}");
    }

    #[test]
    fn test_round_robin_threshold_restart_keeps_rotation() {
        let abc = keys(&["A", "B", "C"]);
        // THRESHOLD % 3 == 1, so the counter at the threshold selects B
        let rr = RoundRobinBalancer::starting_at(COUNTER_RESET_THRESHOLD - 1);
        assert_eq!(run(&rr, &abc, 5), keys(&["A", "B", "C", "A", "B"]));
    }

    #[test]
    fn test_round_robin_concurrent_exact_counts() {
        let rr = Arc::new(RoundRobinBalancer::new());
        let abcd = Arc::new(keys(&["A", "B", "C", "D"]));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let rr = Arc::clone(&rr);
                let abcd = Arc::clone(&abcd);
                std::thread::spawn(move || run(rr.as_ref(), &abcd, 1000))
            })
            .collect();

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.join().unwrap());
        }
        let tally = counts(&all);
        for key in ["A", "B", "C", "D"] {
            assert_eq!(tally[key], 2000, "key {key}");
        }
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let weights = WeightTable::from_pairs([("A", 1)]);
        for strategy in [
            Strategy::RoundRobin,
            Strategy::Random,
            Strategy::WeightedRoundRobin,
        ] {
            assert_eq!(strategy.build(&weights).select(&[]), None, "{strategy}");
        }
    }

    #[test]
    fn test_random_single_and_membership() {
        let random = RandomBalancer::new();
        assert_eq!(random.select(&keys(&["only"])), Some("only".to_string()));

        let abc = keys(&["A", "B", "C"]);
        for pick in run(&random, &abc, 200) {
            assert!(abc.contains(&pick));
        }
    }

    #[test]
    fn test_weighted_order_from_fresh_instance() {
        let weights = WeightTable::from_pairs([("A", 3), ("B", 1)]);
        let wrr = WeightedRoundRobinBalancer::new(&weights);
        assert_eq!(
            run(&wrr, &keys(&["A", "B"]), 4),
            keys(&["A", "A", "A", "B"])
        );
    }

    #[test]
    fn test_weighted_skips_unhealthy_keys() {
        let weights = WeightTable::from_pairs([("A", 3), ("B", 1)]);
        let wrr = WeightedRoundRobinBalancer::new(&weights);
        assert!(run(&wrr, &keys(&["B"]), 10).iter().all(|k| k == "B"));
    }

    #[test]
    fn test_weighted_falls_back_to_rotation() {
        let weights = WeightTable::from_pairs([("A", 2)]);
        let wrr = WeightedRoundRobinBalancer::new(&weights);
        // Neither candidate is weighted
        assert_eq!(
            run(&wrr, &keys(&["X", "Y"]), 4),
            keys(&["X", "Y", "X", "Y"])
        );

        let empty = WeightedRoundRobinBalancer::new(&WeightTable::new());
        assert_eq!(run(&empty, &keys(&["X", "Y"]), 3), keys(&["X", "Y", "X"]));
    }

    #[test]
    fn test_non_positive_weights_normalized() {
        let weights = WeightTable::from_pairs([("A", 0), ("B", -5)]);
        assert_eq!(weights.get("A"), Some(1));
        assert_eq!(weights.get("B"), Some(1));

        let coerced = WeightedRoundRobinBalancer::new(&weights);
        let plain = WeightedRoundRobinBalancer::new(&WeightTable::from_pairs([("A", 1), ("B", 1)]));
        let ab = keys(&["A", "B"]);
        assert_eq!(run(&coerced, &ab, 6), run(&plain, &ab, 6));
    }

    #[test]
    fn test_update_weights_rebuilds_and_resets() {
        let wrr = WeightedRoundRobinBalancer::new(&WeightTable::from_pairs([("A", 1), ("B", 1)]));
        let ab = keys(&["A", "B"]);
        wrr.select(&ab);

        let table = WeightTable::from_pairs([("B", 2), ("A", 1)]);
        wrr.update_weights(&table);
        assert_eq!(*wrr.weights(), table);
        assert_eq!(run(&wrr, &ab, 3), keys(&["B", "B", "A"]));
    }

    #[test]
    fn test_weight_table_keeps_order_on_update() {
        let mut table = WeightTable::from_pairs([("a", 1), ("b", 2)]);
        table.insert("a", 5);
        table.insert("c", 1_000_000);
        let entries: Vec<_> = table.iter().collect();
        assert_eq!(entries, vec![("a", 5), ("b", 2), ("c", 1_000_000)]);

        assert_eq!(table.remove("b"), Some(2));
        assert_eq!(table.remove("b"), None);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_large_weights_stay_proportional() {
        let weights = WeightTable::from_pairs([("A", 30_000), ("B", 10_000)]);
        assert_eq!(weights.total_weight(), 40_000);

        let wrr = WeightedRoundRobinBalancer::new(&weights);
        let tally = counts(&run(&wrr, &keys(&["A", "B"]), 40_000));
        assert_eq!(tally["A"], 30_000);
        assert_eq!(tally["B"], 10_000);
    }

    #[test]
    fn test_huge_weights_do_not_allocate_slots() {
        let weights = WeightTable::from_pairs([("A", i64::MAX), ("B", i64::MAX)]);
        assert_eq!(weights.total_weight(), u64::MAX - 1);

        let wrr = WeightedRoundRobinBalancer::new(&weights);
        assert_eq!(run(&wrr, &keys(&["A", "B"]), 3), keys(&["A", "A", "A"]));
        assert_eq!(run(&wrr, &keys(&["B"]), 2), keys(&["B", "B"]));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("Round-Robin".parse::<Strategy>().unwrap(), Strategy::RoundRobin);
        assert_eq!(" RANDOM ".parse::<Strategy>().unwrap(), Strategy::Random);
        assert_eq!(
            "weighted-round-robin".parse::<Strategy>().unwrap(),
            Strategy::WeightedRoundRobin
        );
        assert!("least-connections".parse::<Strategy>().is_err());
        assert_eq!(Strategy::WeightedRoundRobin.to_string(), "weighted-round-robin");
    }
}
