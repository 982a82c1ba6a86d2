/// Adaptive strategy bookkeeping: per-strategy success/similarity estimates,
/// re-ranking, and batch-size adaptation from recent outcomes.
use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use itertools::Itertools;
use tracing::debug;

use crate::cache::SafeCache;
use crate::mutation::MutationResult;
use crate::r#const::{
    BATCH_ADAPT_MIN_TOTAL, BATCH_GROW_RATIO, BATCH_SHRINK_RATIO, INITIAL_BATCH_SIZE,
    MAX_BATCH_SIZE, MIN_BATCH_SIZE, RESULT_WINDOW_SIZE, STRATEGY_CACHE_TTL_SECS,
    STRATEGY_LEARNING_RATE,
};

/// Names every planner-visible strategy, storage-side first.
pub const DEFAULT_STRATEGIES: &[&str] = &[
    "storage_address_mutation",
    "storage_balance_scaling",
    "storage_counter_increment",
    "storage_bool_flip",
    "storage_mapping_key_mutation",
    "storage_array_length_mutation",
    "multi_slot_coordinated",
    "dependency_aware_mutation",
    "input_parameter_step",
    "input_boundary_values",
    "input_address_substitution",
    "input_bit_patterns",
    "input_constant_hinted",
    "bytes_pattern_fill",
];

/// A storage-side strategy mutates slots, everything else mutates input.
pub fn is_storage_strategy(name: &str) -> bool {
    name.starts_with("storage_")
        || name == "multi_slot_coordinated"
        || name == "dependency_aware_mutation"
}

#[derive(Clone, Debug)]
pub struct MutationStrategy {
    pub name: String,
    pub priority: u8,
    pub success_rate: f64,
    pub avg_similarity: f64,
    pub total_attempts: u64,
    pub successful_attempts: u64,
    pub last_used: Option<Instant>,
}

impl MutationStrategy {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            priority: 5,
            success_rate: 0.0,
            avg_similarity: 0.0,
            total_attempts: 0,
            successful_attempts: 0,
            last_used: None,
        }
    }

    /// Weighted blend of live estimates, recency, and an exploration bonus
    /// for barely-tried strategies.
    fn comprehensive_score(&self, now: Instant) -> f64 {
        let recency = match self.last_used {
            Some(at) => {
                let hours = now.saturating_duration_since(at).as_secs_f64() / 3600.0;
                (-hours / 24.0).exp()
            }
            None => 1.0,
        };
        let exploration = if self.total_attempts < 10 { 0.2 } else { 0.0 };
        let score = 0.24 * self.success_rate
            + 0.24 * self.avg_similarity
            + 0.2 * recency
            + 0.2 * exploration;
        score.clamp(0.0, 1.0)
    }
}

#[derive(Clone, Debug)]
pub struct RankedStrategy {
    pub name: String,
    pub score: f64,
    pub priority: u8,
}

/// Read-only view the planner works against.
#[derive(Clone, Debug)]
pub struct StrategySnapshot {
    pub ranked: Vec<RankedStrategy>,
    pub batch_size: usize,
}

#[derive(Clone, Copy, Debug)]
struct WindowEntry {
    similarity: f64,
    success: bool,
}

struct ManagerState {
    strategies: HashMap<String, MutationStrategy>,
    recent: VecDeque<WindowEntry>,
    total: u64,
    high_similarity_count: u64,
    adaptive_batch_size: f64,
}

/// Exclusive owner of the strategy table. Recording takes the write lock,
/// snapshots the read lock; recordings are linearisable.
pub struct StrategyManager {
    state: RwLock<ManagerState>,
    similarity_threshold: f64,
    /// memoised (mutation_type, variant) outcomes, 5 minute TTL
    pub result_cache: SafeCache<f64>,
}

impl StrategyManager {
    pub fn new(similarity_threshold: f64) -> Self {
        let strategies = DEFAULT_STRATEGIES
            .iter()
            .map(|name| (name.to_string(), MutationStrategy::new(name)))
            .collect();
        Self {
            state: RwLock::new(ManagerState {
                strategies,
                recent: VecDeque::with_capacity(RESULT_WINDOW_SIZE),
                total: 0,
                high_similarity_count: 0,
                adaptive_batch_size: INITIAL_BATCH_SIZE as f64,
            }),
            similarity_threshold,
            result_cache: SafeCache::new(Duration::from_secs(STRATEGY_CACHE_TTL_SECS)),
        }
    }

    pub fn current_batch_size(&self) -> usize {
        self.state.read().unwrap().adaptive_batch_size as usize
    }

    /// Fold one mutation outcome into the table and adapt the batch size.
    pub fn record_result(&self, result: &MutationResult) {
        let mut state = self.state.write().unwrap();
        if state.recent.len() >= RESULT_WINDOW_SIZE {
            state.recent.pop_front();
        }
        state.recent.push_back(WindowEntry {
            similarity: result.similarity,
            success: result.success,
        });

        let alpha = STRATEGY_LEARNING_RATE;
        let entry = state
            .strategies
            .entry(result.candidate.strategy.clone())
            .or_insert_with(|| MutationStrategy::new(&result.candidate.strategy));
        entry.total_attempts += 1;
        if result.success {
            entry.successful_attempts += 1;
        }
        let observed = if result.success { 1.0 } else { 0.0 };
        entry.success_rate = (1.0 - alpha) * entry.success_rate + alpha * observed;
        entry.avg_similarity = (1.0 - alpha) * entry.avg_similarity + alpha * result.similarity;
        entry.last_used = Some(Instant::now());

        state.total += 1;
        if result.similarity >= self.similarity_threshold {
            state.high_similarity_count += 1;
        }

        if state.total >= BATCH_ADAPT_MIN_TOTAL {
            let ratio = state.high_similarity_count as f64 / state.total as f64;
            if ratio > BATCH_GROW_RATIO {
                state.adaptive_batch_size *= 1.1;
            } else if ratio < BATCH_SHRINK_RATIO {
                state.adaptive_batch_size *= 0.9;
            }
            state.adaptive_batch_size = state
                .adaptive_batch_size
                .clamp(MIN_BATCH_SIZE as f64, MAX_BATCH_SIZE as f64);
        }

        self.result_cache.insert(
            format!("{:?}:{}", result.candidate.mod_type, result.candidate.id),
            result.similarity,
        );
    }

    /// Strategies ranked by comprehensive score, best first.
    pub fn ranked_strategies(&self) -> Vec<RankedStrategy> {
        let state = self.state.read().unwrap();
        let now = Instant::now();
        state
            .strategies
            .values()
            .map(|s| {
                let score = s.comprehensive_score(now);
                RankedStrategy {
                    name: s.name.clone(),
                    score,
                    priority: (score * 10.0).round() as u8,
                }
            })
            .sorted_by(|a, b| {
                b.score
                    .partial_cmp(&a.score)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.name.cmp(&b.name))
            })
            .collect()
    }

    pub fn snapshot(&self) -> StrategySnapshot {
        let snapshot = StrategySnapshot {
            ranked: self.ranked_strategies(),
            batch_size: self.current_batch_size(),
        };
        debug!(
            "strategy snapshot: batch={} leader={:?}",
            snapshot.batch_size,
            snapshot.ranked.first().map(|r| r.name.clone())
        );
        snapshot
    }

    pub fn strategy_stats(&self, name: &str) -> Option<MutationStrategy> {
        self.state.read().unwrap().strategies.get(name).cloned()
    }

    /// Full table export for operators, rank order.
    pub fn export_stats(&self) -> Vec<MutationStrategy> {
        let ranked = self.ranked_strategies();
        let state = self.state.read().unwrap();
        ranked
            .iter()
            .filter_map(|r| state.strategies.get(&r.name).cloned())
            .collect()
    }

    pub fn total_recorded(&self) -> u64 {
        self.state.read().unwrap().total
    }
}
