//! Host worker pool with static work partitioning.
//!
//! Every host stage splits its work into one contiguous block per worker and
//! combines per-worker partial results in worker order, so results do not
//! depend on scheduling.

use anyhow::{Context, Result};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::ops::Range;

pub struct HostThreads {
    pool: ThreadPool,
    nthreads: usize,
}

impl HostThreads {
    pub fn new(nthreads: usize, name: &str) -> Result<Self> {
        let nthreads = nthreads.max(1);
        let prefix = name.to_string();
        let pool = ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .thread_name(move |i| format!("{}-{}", prefix, i))
            .build()
            .with_context(|| format!("Failed to build {} host thread pool", name))?;
        Ok(Self { pool, nthreads })
    }

    pub fn nthreads(&self) -> usize {
        self.nthreads
    }

    /// Runs `f` inside the pool so nested parallel iterators use its workers.
    pub fn install<R, F>(&self, f: F) -> R
    where
        R: Send,
        F: FnOnce() -> R + Send,
    {
        self.pool.install(f)
    }

    /// Block length giving each worker one contiguous share of `total` items.
    pub fn chunk_len(&self, total: usize) -> usize {
        static_chunk_len(total, self.nthreads)
    }

    /// Runs `f(worker, range)` for every worker's share; results in worker order.
    pub fn map_static<R, F>(&self, total: usize, f: F) -> Vec<R>
    where
        R: Send,
        F: Fn(usize, Range<usize>) -> R + Sync + Send,
    {
        use rayon::prelude::*;
        let nthreads = self.nthreads;
        self.pool.install(|| {
            (0..nthreads)
                .into_par_iter()
                .map(|t| f(t, static_range(total, nthreads, t)))
                .collect()
        })
    }
}

pub fn static_chunk_len(total: usize, nthreads: usize) -> usize {
    total.div_ceil(nthreads.max(1)).max(1)
}

/// Items owned by `thread` when `total` items are split into contiguous blocks.
pub fn static_range(total: usize, nthreads: usize, thread: usize) -> Range<usize> {
    let chunk = static_chunk_len(total, nthreads);
    let start = (thread * chunk).min(total);
    let end = ((thread + 1) * chunk).min(total);
    start..end
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_static_range_covers_everything_once() {
        for total in [0, 1, 7, 64, 1001] {
            for nthreads in [1, 3, 4, 8] {
                let mut covered = vec![0u8; total];
                for t in 0..nthreads {
                    for i in static_range(total, nthreads, t) {
                        covered[i] += 1;
                    }
                }
                assert!(covered.iter().all(|&c| c == 1), "total={} nthreads={}", total, nthreads);
            }
        }
    }

    #[test]
    fn test_static_range_matches_chunks() {
        let data: Vec<usize> = (0..23).collect();
        let chunk = static_chunk_len(data.len(), 4);
        for (t, block) in data.chunks(chunk).enumerate() {
            let range = static_range(data.len(), 4, t);
            assert_eq!(block, &data[range]);
        }
    }

    #[test]
    fn test_map_static_ordered() {
        let threads = HostThreads::new(3, "test").unwrap();
        let sums = threads.map_static(10, |_, range| range.sum::<usize>());
        assert_eq!(sums, vec![6, 22, 17]);
    }
}
