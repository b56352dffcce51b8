//! Backend selection once the pool is saturated
//!
//! When the backend cap is reached no new backend is provisioned and the
//! request goes to one of the live backends instead. The choice is made by a
//! [`SelectionPolicy`], uniform random by default.

use rand::Rng;

/// Chooses one backend among the selectable candidates
pub trait SelectionPolicy: Send + Sync {
    /// Index into `candidates`, or `None` when the list is empty
    fn choose(&self, candidates: &[&str]) -> Option<usize>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Every candidate is equally likely
#[derive(Debug, Clone, Copy, Default)]
pub struct UniformRandom;

impl SelectionPolicy for UniformRandom {
    fn choose(&self, candidates: &[&str]) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..candidates.len()))
    }

    fn name(&self) -> &'static str {
        "uniform-random"
    }
}
