//! Shared ordered worker-pool primitive underlying the parallel compressor and parallel
//! cipher. Both have the identical shape: `submit(bytes)` assigns a monotone index, a
//! bounded number of workers process items off of a shared queue, and a
//! [`Reassembler`](crate::reassembler::Reassembler) on the consumer side releases results strictly
//! in submission order.
//!
//! CPU-bound work (compression, encryption) is kept off the async reactor via
//! [`tokio::task::spawn_blocking`], so the I/O thread never blocks on a worker queue -- Tokio's
//! blocking-pool slots play the role a dedicated OS thread or process pool would.

use crate::reassembler::Reassembler;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// An ordered worker pool bound to a concrete `transform` function, shared by the compressor and
/// cipher. `transform` returns `None` on a per-item failure, which is turned into a logged,
/// index-preserving empty-bytes completion.
pub struct WorkerPool<F> {
    next_index: AtomicU64,
    transform: Arc<F>,
    completions: mpsc::UnboundedSender<(u64, Vec<u8>)>,
}

impl<F> WorkerPool<F>
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    /// Submits `bytes` for transformation, returning the index assigned to it. The result is
    /// delivered asynchronously on the pool's completion channel.
    pub fn submit(self: &Arc<Self>, bytes: Vec<u8>) -> u64 {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        let transform = Arc::clone(&self.transform);
        let completions = self.completions.clone();
        tokio::task::spawn_blocking(move || {
            let result = transform(&bytes).unwrap_or_default();
            let _ = completions.send((index, result));
        });
        index
    }
}

/// Spawns a pool of workers applying `transform` to each submitted blob, returning the pool
/// handle and its completion receiver. Worker concurrency is bounded by Tokio's blocking thread
/// pool rather than a pool-local semaphore, since exact worker-count tuning is a purely local
/// concern, unobserved by the peer.
#[must_use]
pub fn spawn_pool<F>(transform: F) -> (Arc<WorkerPool<F>>, mpsc::UnboundedReceiver<(u64, Vec<u8>)>)
where
    F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pool = Arc::new(WorkerPool {
        next_index: AtomicU64::new(0),
        transform: Arc::new(transform),
        completions: tx,
    });
    (pool, rx)
}

/// Drains ready completions from `rx` into `reassembler`, returning every blob that is now
/// releasable in order. Used identically by the compressor and cipher consumers.
pub fn drain_ready(
    reassembler: &mut Reassembler,
    rx: &mut mpsc::UnboundedReceiver<(u64, Vec<u8>)>,
) -> Vec<Vec<u8>> {
    let mut released = Vec::new();
    while let Ok((index, bytes)) = rx.try_recv() {
        released.extend(reassembler.submit(index, bytes));
    }
    released
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submit_preserves_order_through_reassembler() {
        let (pool, mut rx) = spawn_pool(|bytes: &[u8]| Some(bytes.iter().rev().copied().collect()));

        for i in 0..20u8 {
            pool.submit(vec![i]);
        }

        let mut reassembler = Reassembler::new();
        let mut released = Vec::new();
        while released.len() < 20 {
            if let Some((index, bytes)) = rx.recv().await {
                released.extend(reassembler.submit(index, bytes));
            }
        }

        let expected: Vec<Vec<u8>> = (0..20u8).map(|i| vec![i]).collect();
        assert_eq!(released, expected);
    }

    #[tokio::test]
    async fn failed_item_still_consumes_its_index() {
        let (pool, mut rx) = spawn_pool(|bytes: &[u8]| {
            if bytes == [1] {
                None
            } else {
                Some(bytes.to_vec())
            }
        });

        pool.submit(vec![0]);
        pool.submit(vec![1]);
        pool.submit(vec![2]);

        let mut reassembler = Reassembler::new();
        let mut released = Vec::new();
        while released.len() < 2 && reassembler.next_index() < 3 {
            if let Some((index, bytes)) = rx.recv().await {
                released.extend(reassembler.submit(index, bytes));
            }
        }

        assert_eq!(released, vec![vec![0], vec![2]]);
        assert_eq!(reassembler.next_index(), 3);
    }
}
