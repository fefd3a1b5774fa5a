//! Batched per-item processing under the batch circuit breaker.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ScrapeResult;
use crate::retry::BatchCircuitBreaker;

/// How a batched loop ended, item by item.
#[derive(Debug)]
pub struct BatchOutcome<T, U> {
    pub succeeded: Vec<U>,
    pub failed: Vec<T>,
    /// Items never started because the breaker tripped or the run was
    /// cancelled.
    pub unattempted: Vec<T>,
    pub tripped: bool,
    pub cancelled: bool,
}

impl<T, U> BatchOutcome<T, U> {
    pub fn attempted(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Process `items` in batches of `batch_size`, one at a time, sleeping
/// `delay` between items.
///
/// The breaker counts consecutive failures across batch boundaries. Once it
/// trips, the remaining items are returned unattempted.
pub async fn process_in_batches<T, U, F, Fut>(
    items: Vec<T>,
    batch_size: usize,
    breaker: &mut BatchCircuitBreaker,
    delay: Duration,
    cancel: &CancellationToken,
    mut op: F,
) -> BatchOutcome<T, U>
where
    T: Clone,
    F: FnMut(T) -> Fut,
    Fut: Future<Output = ScrapeResult<U>>,
{
    let total = items.len();
    let batch_size = batch_size.max(1);
    let batches = total.div_ceil(batch_size);
    let mut outcome = BatchOutcome {
        succeeded: Vec::new(),
        failed: Vec::new(),
        unattempted: Vec::new(),
        tripped: false,
        cancelled: false,
    };

    let mut pending = items.into_iter().enumerate().peekable();
    while let Some((index, item)) = pending.next() {
        if index % batch_size == 0 {
            info!(
                "Detail batch {}/{} ({} items)",
                index / batch_size + 1,
                batches,
                batch_size.min(total - index)
            );
        }
        if cancel.is_cancelled() {
            outcome.cancelled = true;
            outcome.unattempted.push(item);
            break;
        }

        match op(item.clone()).await {
            Ok(value) => {
                breaker.record_success();
                outcome.succeeded.push(value);
            }
            Err(e) => {
                warn!("Item {}/{} failed: {}", index + 1, total, e);
                outcome.failed.push(item);
                if breaker.record_failure() {
                    info!("Stopping detail phase, {} items left unattempted", total - index - 1);
                    outcome.tripped = true;
                    break;
                }
            }
        }

        if pending.peek().is_some() && !delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => {
                    outcome.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    outcome.unattempted.extend(pending.map(|(_, item)| item));
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ScrapeError;

    fn fails_between(lo: u32, hi: u32) -> impl FnMut(u32) -> std::future::Ready<ScrapeResult<u32>> {
        move |n| {
            std::future::ready(if (lo..=hi).contains(&n) {
                Err(ScrapeError::http(503, format!("https://a.com/l/{}", n)))
            } else {
                Ok(n)
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_trips_and_keeps_prior_successes() {
        let items: Vec<u32> = (1..=30).collect();
        let mut breaker = BatchCircuitBreaker::new(10);
        let outcome = process_in_batches(
            items,
            25,
            &mut breaker,
            Duration::from_secs(2),
            &CancellationToken::new(),
            fails_between(10, 19),
        )
        .await;

        assert!(outcome.tripped);
        assert_eq!(outcome.succeeded, (1..=9).collect::<Vec<_>>());
        assert_eq!(outcome.failed, (10..=19).collect::<Vec<_>>());
        assert_eq!(outcome.unattempted, (20..=30).collect::<Vec<_>>());
        assert_eq!(outcome.attempted(), 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_breaker_across_batches() {
        // 4 failures, a success, 4 more failures: never 5 in a row
        let mut breaker = BatchCircuitBreaker::new(5);
        let mut n = 0u32;
        let outcome = process_in_batches(
            (1..=12).collect::<Vec<u32>>(),
            3,
            &mut breaker,
            Duration::ZERO,
            &CancellationToken::new(),
            |item| {
                n += 1;
                std::future::ready(if item == 5 || item > 9 {
                    Ok(item)
                } else {
                    Err(ScrapeError::Parse("no title".into()))
                })
            },
        )
        .await;
        assert_eq!(n, 12);
        assert!(!outcome.tripped);
        assert_eq!(outcome.succeeded, vec![5, 10, 11, 12]);
        assert_eq!(outcome.failed.len(), 8);
        assert!(outcome.unattempted.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_leaves_rest_unattempted() {
        let cancel = CancellationToken::new();
        let mut breaker = BatchCircuitBreaker::new(5);
        let outcome = process_in_batches(
            (1..=5).collect::<Vec<u32>>(),
            25,
            &mut breaker,
            Duration::from_millis(100),
            &cancel,
            |item| {
                if item == 2 {
                    cancel.cancel();
                }
                std::future::ready(Ok::<_, ScrapeError>(item))
            },
        )
        .await;
        assert!(outcome.cancelled);
        assert_eq!(outcome.succeeded, vec![1, 2]);
        assert_eq!(outcome.unattempted, vec![3, 4, 5]);
    }

    #[tokio::test]
    async fn test_empty_input() {
        let mut breaker = BatchCircuitBreaker::new(5);
        let outcome: BatchOutcome<u32, u32> = process_in_batches(
            Vec::new(),
            25,
            &mut breaker,
            Duration::ZERO,
            &CancellationToken::new(),
            |n: u32| std::future::ready(Ok(n)),
        )
        .await;
        assert_eq!(outcome.attempted(), 0);
        assert!(!outcome.tripped);
    }
}
