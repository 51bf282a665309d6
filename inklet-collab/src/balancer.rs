//! Least-connections assignment of incoming connections to workers.
//!
//! One atomic counter per worker; the accept loop picks the worker with
//! the fewest live connections and bumps its count before handing the
//! socket over. Counters are the only shared state, so assignment never
//! touches the workers' own connection sets.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Picks the least-loaded worker for each new connection.
#[derive(Clone)]
pub struct LoadBalancer {
    counts: Arc<Vec<AtomicUsize>>,
}

impl LoadBalancer {
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "need at least one worker");
        Self {
            counts: Arc::new((0..workers).map(|_| AtomicUsize::new(0)).collect()),
        }
    }

    pub fn workers(&self) -> usize {
        self.counts.len()
    }

    /// Index of the worker with the fewest connections; ties go to the
    /// lowest index. Increments that worker's count.
    pub fn assign(&self) -> usize {
        let mut best = 0;
        let mut best_count = usize::MAX;
        for (i, count) in self.counts.iter().enumerate() {
            let n = count.load(Ordering::Relaxed);
            if n < best_count {
                best = i;
                best_count = n;
            }
        }
        self.counts[best].fetch_add(1, Ordering::Relaxed);
        best
    }

    /// A worker dropped one of its connections.
    pub fn release(&self, worker: usize) {
        self.counts[worker].fetch_sub(1, Ordering::Relaxed);
    }

    pub fn connections(&self, worker: usize) -> usize {
        self.counts[worker].load(Ordering::Relaxed)
    }

    pub fn total_connections(&self) -> usize {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assigns_round_robin_from_equal_load() {
        let lb = LoadBalancer::new(3);
        assert_eq!(lb.assign(), 0);
        assert_eq!(lb.assign(), 1);
        assert_eq!(lb.assign(), 2);
        // All equal again; ties go to the lowest index.
        assert_eq!(lb.assign(), 0);
    }

    #[test]
    fn prefers_the_least_loaded_worker() {
        let lb = LoadBalancer::new(3);
        for _ in 0..3 {
            lb.assign();
        }
        lb.release(1);
        assert_eq!(lb.assign(), 1);
        assert_eq!(lb.connections(1), 1);
    }

    #[test]
    fn release_rebalances() {
        let lb = LoadBalancer::new(2);
        assert_eq!(lb.assign(), 0);
        assert_eq!(lb.assign(), 1);
        assert_eq!(lb.assign(), 0);
        assert_eq!(lb.total_connections(), 3);

        lb.release(0);
        lb.release(0);
        assert_eq!(lb.assign(), 0);
        assert_eq!(lb.total_connections(), 3);
    }
}
