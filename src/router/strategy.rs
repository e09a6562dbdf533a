use std::{
    str::FromStr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use rand::Rng;

use crate::router::Backend;

/// Picks one backend among healthy candidates, in proportion to weight over the long run.
pub trait SelectionStrategy: Send + Sync {
    fn pick(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StrategyKind {
    #[default]
    WeightedRandom,
    WeightedRoundRobin,
}

impl StrategyKind {
    pub fn build(self) -> Arc<dyn SelectionStrategy> {
        match self {
            Self::WeightedRandom => Arc::new(WeightedRandom),
            Self::WeightedRoundRobin => Arc::new(WeightedRoundRobin::new()),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "weighted_random" | "random" => Ok(Self::WeightedRandom),
            "weighted_round_robin" | "round_robin" => Ok(Self::WeightedRoundRobin),
            other => Err(format!("unsupported routing strategy: {other}")),
        }
    }
}

fn total_weight(candidates: &[Arc<Backend>]) -> u64 {
    candidates.iter().map(|b| u64::from(b.weight.max(1))).sum()
}

/// Walks cumulative weights until `offset` falls inside a backend's share.
fn pick_at(candidates: &[Arc<Backend>], mut offset: u64) -> Option<Arc<Backend>> {
    for backend in candidates {
        let weight = u64::from(backend.weight.max(1));
        if offset < weight {
            return Some(backend.clone());
        }
        offset -= weight;
    }
    candidates.last().cloned()
}

pub struct WeightedRandom;

impl SelectionStrategy for WeightedRandom {
    fn pick(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        match candidates {
            [] => None,
            [only] => Some(only.clone()),
            _ => {
                let offset = rand::thread_rng().gen_range(0..total_weight(candidates));
                pick_at(candidates, offset)
            }
        }
    }
}

pub struct WeightedRoundRobin {
    counter: AtomicU64,
}

impl WeightedRoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }
}

impl Default for WeightedRoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl SelectionStrategy for WeightedRoundRobin {
    fn pick(&self, candidates: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        if candidates.is_empty() {
            return None;
        }
        let seed = self.counter.fetch_add(1, Ordering::Relaxed);
        pick_at(candidates, seed % total_weight(candidates))
    }
}
