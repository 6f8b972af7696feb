//! Bounded-concurrency fan-out with index-stable results
//!
//! Every batch operation in the pipeline (staging uploads to disk, pushing
//! files to the object store, fetching objects back on the worker) uses the
//! same discipline: fan out over a fixed set of items with at most `limit`
//! operations in flight, fan in to a single completion point, and report the
//! first error observed. Each item writes into its own pre-allocated slot,
//! so result ordering always matches input ordering regardless of completion
//! order.
//!
//! Cancellation is cooperative: the first failure cancels the shared token,
//! and siblings that have not started yet skip their work. I/O that is
//! already in flight completes naturally. A caller-supplied deadline on the
//! token surfaces through the same first-error path.

use std::future::Future;

use futures::{stream, StreamExt};
use tokio_util::sync::CancellationToken;

/// Outcome of one bounded batch: one slot per input item, index-aligned,
/// plus the first error observed (if any).
///
/// A slot is `None` when its item failed or was skipped after cancellation.
#[derive(Debug)]
pub struct BatchOutcome<T, E> {
    pub slots: Vec<Option<T>>,
    pub first_error: Option<E>,
}

impl<T, E> BatchOutcome<T, E> {
    /// Collapse the batch to all-or-nothing: the completed values in input
    /// order, or the first error.
    pub fn into_result(self) -> std::result::Result<Vec<T>, E> {
        if let Some(err) = self.first_error {
            return Err(err);
        }
        Ok(self.slots.into_iter().flatten().collect())
    }
}

/// Run `op` over `items` with at most `limit` operations in flight.
///
/// `op` receives the item's input index; its result lands in the slot with
/// the same index. On the first error the shared `cancel` token is
/// cancelled, so items that have not started observe it and yield an empty
/// slot instead of doing work. Per-item errors never panic the batch; the
/// first one is reported, the rest are dropped.
pub async fn run_indexed<I, T, E, F, Fut>(
    items: Vec<I>,
    limit: usize,
    cancel: &CancellationToken,
    op: F,
) -> BatchOutcome<T, E>
where
    F: Fn(usize, I) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
{
    let total = items.len();
    let mut slots: Vec<Option<T>> = Vec::with_capacity(total);
    slots.resize_with(total, || None);
    let mut first_error: Option<E> = None;

    let mut completions = stream::iter(items.into_iter().enumerate())
        .map(|(index, item)| {
            let token = cancel.clone();
            let work = op(index, item);
            async move {
                if token.is_cancelled() {
                    return (index, None);
                }
                match work.await {
                    Ok(value) => (index, Some(Ok(value))),
                    Err(err) => {
                        token.cancel();
                        (index, Some(Err(err)))
                    }
                }
            }
        })
        .buffer_unordered(limit.max(1));

    while let Some((index, completion)) = completions.next().await {
        match completion {
            Some(Ok(value)) => slots[index] = Some(value),
            Some(Err(err)) => {
                if first_error.is_none() {
                    first_error = Some(err);
                }
            }
            // Skipped after a sibling failure; slot stays empty.
            None => {}
        }
    }

    BatchOutcome { slots, first_error }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_index_stability_under_unordered_completion() {
        // Later items finish first; slots must still line up with input order.
        let items: Vec<u64> = (0..16).collect();
        let cancel = CancellationToken::new();

        let outcome = run_indexed(items, 8, &cancel, |index, value| async move {
            tokio::time::sleep(Duration::from_millis(40 - (index as u64 * 2))).await;
            Ok::<_, std::io::Error>(value * 10)
        })
        .await;

        let results = outcome.into_result().unwrap();
        assert_eq!(results.len(), 16);
        for (i, value) in results.iter().enumerate() {
            assert_eq!(*value, i as u64 * 10);
        }
    }

    #[tokio::test]
    async fn test_limit_one_is_sequential() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let outcome = run_indexed((0..10).collect(), 1, &cancel, |_, value: u32| {
            let in_flight = in_flight.clone();
            let max_seen = max_seen.clone();
            async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(value)
            }
        })
        .await;

        assert!(outcome.into_result().is_ok());
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_first_error_wins_and_completed_slots_survive() {
        let cancel = CancellationToken::new();

        let outcome: BatchOutcome<u32, String> =
            run_indexed(vec![1u32, 2, 3], 3, &cancel, |index, value| async move {
                if index == 1 {
                    Err("boom".to_string())
                } else {
                    Ok(value * 100)
                }
            })
            .await;

        assert_eq!(outcome.first_error.as_deref(), Some("boom"));
        assert_eq!(outcome.slots[0], Some(100));
        assert_eq!(outcome.slots[1], None);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancellation_skips_unstarted_items() {
        // limit=1 serializes execution, so everything after the failing item
        // must observe the cancelled token and never run.
        let started = Arc::new(AtomicUsize::new(0));
        let cancel = CancellationToken::new();

        let outcome: BatchOutcome<(), &str> =
            run_indexed((0..6).collect(), 1, &cancel, |index, _: u32| {
                let started = started.clone();
                async move {
                    started.fetch_add(1, Ordering::SeqCst);
                    if index == 2 {
                        Err("disk full")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert_eq!(outcome.first_error, Some("disk full"));
        assert_eq!(started.load(Ordering::SeqCst), 3);
        assert!(outcome.slots[3..].iter().all(|slot| slot.is_none()));
    }

    #[tokio::test]
    async fn test_pre_cancelled_token_runs_nothing() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome: BatchOutcome<u32, &str> =
            run_indexed(vec![1u32, 2, 3], 4, &cancel, |_, value| async move {
                Ok(value)
            })
            .await;

        assert!(outcome.first_error.is_none());
        assert!(outcome.slots.iter().all(|slot| slot.is_none()));
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let cancel = CancellationToken::new();
        let outcome: BatchOutcome<u32, &str> =
            run_indexed(Vec::new(), 4, &cancel, |_, value| async move { Ok(value) }).await;
        assert!(outcome.into_result().unwrap().is_empty());
    }
}
