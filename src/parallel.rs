//! Cost-balanced partitioning of independent per-star work over a
//! worker pool.
//!
//! Work items are independent: no item is read or written by more than
//! one worker, so workers need no locking. Each call plans contiguous
//! chunks whose expected cost (items plus a fixed per-chunk overhead)
//! is balanced, runs one scoped worker per chunk, and merges the
//! per-chunk outputs single-threaded after the join, preserving item
//! order.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

/// Cooperative cancellation flag, polled between items.
///
/// Setting the flag never preempts a worker; in-flight items finish and
/// the partitioned run reports cancellation instead of a result.
#[derive(Clone, Debug, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Available hardware concurrency.
pub fn hardware_workers() -> usize {
    num_cpus::get().max(1)
}

/// Plan contiguous chunks over `len` items.
///
/// Adds workers one at a time while the largest chunk still shrinks by
/// more than `overhead_hint` items' worth of cost, so cheap work is not
/// spread over more chunks than the per-chunk overhead justifies.
/// Chunk lengths differ by at most one and cover `0..len` exactly once.
pub fn partition(len: usize, overhead_hint: usize, max_workers: usize) -> Vec<Range<usize>> {
    if len == 0 {
        return Vec::new();
    }
    let max_workers = max_workers.clamp(1, len);

    let mut workers = 1;
    while workers < max_workers {
        let current = len.div_ceil(workers);
        let proposed = len.div_ceil(workers + 1);
        if current - proposed > overhead_hint {
            workers += 1;
        } else {
            break;
        }
    }

    let base = len / workers;
    let remainder = len % workers;
    let mut chunks = Vec::with_capacity(workers);
    let mut start = 0;
    for i in 0..workers {
        let size = base + usize::from(i < remainder);
        chunks.push(start..start + size);
        start += size;
    }
    chunks
}

/// Run `work` over every item on a pool of chunk workers and return the
/// outputs in item order, or `None` when `abort` was raised.
///
/// Chunks are planned by [`partition`] against the available hardware
/// concurrency; the abort flag is polled between items.
pub fn run_partitioned<T, R, F>(
    items: &[T],
    work: F,
    overhead_hint: usize,
    abort: &AbortFlag,
) -> Option<Vec<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> R + Sync,
{
    let chunks = partition(items.len(), overhead_hint, hardware_workers());
    debug!(
        "partitioned run: {} items over {} chunks",
        items.len(),
        chunks.len()
    );

    let per_chunk: Vec<Vec<R>> = chunks
        .into_par_iter()
        .map(|range| {
            let mut out = Vec::with_capacity(range.len());
            for item in &items[range] {
                if abort.is_set() {
                    break;
                }
                out.push(work(item));
            }
            out
        })
        .collect();

    if abort.is_set() {
        return None;
    }

    // Single-threaded ordered merge
    Some(per_chunk.into_iter().flatten().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_covers_exactly_once() {
        for &(len, overhead, workers) in
            &[(1usize, 0usize, 8usize), (17, 0, 4), (100, 3, 8), (5, 100, 8)]
        {
            let chunks = partition(len, overhead, workers);
            let mut expected = 0;
            for chunk in &chunks {
                assert_eq!(chunk.start, expected);
                expected = chunk.end;
            }
            assert_eq!(expected, len);
        }
    }

    #[test]
    fn test_partition_balanced_sizes() {
        let chunks = partition(103, 0, 4);
        assert_eq!(chunks.len(), 4);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes.iter().sum::<usize>(), 103);
        assert!(sizes.iter().max().unwrap() - sizes.iter().min().unwrap() <= 1);
    }

    #[test]
    fn test_partition_respects_overhead() {
        // Splitting 100 items in two saves 50 per chunk; an overhead
        // larger than that keeps everything in one chunk.
        assert_eq!(partition(100, 60, 8).len(), 1);
        assert!(partition(100, 10, 8).len() > 1);
    }

    #[test]
    fn test_partition_empty() {
        assert!(partition(0, 5, 8).is_empty());
    }

    #[test]
    fn test_run_preserves_order() {
        let items: Vec<u64> = (0..1000).collect();
        let abort = AbortFlag::new();
        let squares = run_partitioned(&items, |&v| v * v, 0, &abort).unwrap();
        assert_eq!(squares.len(), 1000);
        for (i, sq) in squares.iter().enumerate() {
            assert_eq!(*sq, (i as u64) * (i as u64));
        }
    }

    #[test]
    fn test_abort_yields_none() {
        let items: Vec<u64> = (0..64).collect();
        let abort = AbortFlag::new();
        abort.set();
        assert!(run_partitioned(&items, |&v| v, 0, &abort).is_none());
    }
}
