//! Bounded-parallel batch execution with abort and revert callbacks.
//!
//! [`TaskExecutor`] applies one async action to every item of a batch on a
//! [`WorkerPool`]. Work runs inside the calling task, driven through
//! `buffer_unordered`; a pool of size 0 drives one item at a time, in order.
//!
//! When any item fails, the failure callback sees each failed item with its
//! error as it fails. Once the batch ends, the abort callback sees every item
//! not known to have succeeded (failed or never started) and the revert
//! callback sees each item that succeeded.

use futures::future::BoxFuture;
use futures::{StreamExt, stream};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::{debug, warn};

/// Worker slots shared by every batch run within one job-level operation.
///
/// Closed on [`WorkerPool::shutdown`] or drop; items not yet started when the
/// pool closes are treated as never started.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    permits: Semaphore,
}

impl WorkerPool {
    /// A pool running up to `size` items at once. 0 means synchronous.
    pub fn new(size: usize) -> Self {
        debug!("Creating worker pool of size {size}");
        Self {
            size,
            permits: Semaphore::new(size.max(1)),
        }
    }

    /// A pool that runs items one after another in the caller.
    pub fn synchronous() -> Self {
        Self::new(0)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_synchronous(&self) -> bool {
        self.size == 0
    }

    /// Items the executor may drive at once.
    fn concurrency(&self) -> usize {
        self.size.max(1)
    }

    async fn acquire(&self) -> Option<SemaphorePermit<'_>> {
        self.permits.acquire().await.ok()
    }

    pub fn is_shutdown(&self) -> bool {
        self.permits.is_closed()
    }

    pub fn shutdown(&self) {
        if !self.permits.is_closed() {
            debug!("Shutting down worker pool of size {}", self.size);
            self.permits.close();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Callback invoked with an item.
pub type ItemCallback<'a, T> = Box<dyn Fn(T) -> BoxFuture<'a, ()> + Send + Sync + 'a>;

/// Callback invoked with a failed item and its error.
pub type FailureCallback<'a, T, E> = Box<dyn Fn(T, &E) -> BoxFuture<'a, ()> + Send + Sync + 'a>;

enum Slot<E> {
    NotStarted,
    Succeeded,
    Failed(E),
}

/// Builder and driver for one batch.
pub struct TaskExecutor<'a, T, E> {
    items: Vec<T>,
    pool: Option<&'a WorkerPool>,
    stop_on_failure: bool,
    rethrow: bool,
    on_failure: Option<FailureCallback<'a, T, E>>,
    abort_with: Option<ItemCallback<'a, T>>,
    revert_with: Option<ItemCallback<'a, T>>,
}

impl<'a, T, E> TaskExecutor<'a, T, E>
where
    T: Clone + Send + Sync + 'a,
    E: Send + 'a,
{
    /// Start a batch over `items`.
    pub fn foreach(items: impl IntoIterator<Item = T>) -> Self {
        Self {
            items: items.into_iter().collect(),
            pool: None,
            stop_on_failure: false,
            rethrow: false,
            on_failure: None,
            abort_with: None,
            revert_with: None,
        }
    }

    /// Run on `pool`. Without a pool the batch is synchronous.
    pub fn execute_with(mut self, pool: &'a WorkerPool) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Start no further items once one has failed.
    pub fn stop_on_failure(mut self) -> Self {
        self.stop_on_failure = true;
        self
    }

    /// Return the first failure, in submission order, once the batch ends.
    pub fn throw_failure_when_finished(mut self) -> Self {
        self.rethrow = true;
        self
    }

    pub fn on_failure<F>(mut self, callback: F) -> Self
    where
        F: Fn(T, &E) -> BoxFuture<'a, ()> + Send + Sync + 'a,
    {
        self.on_failure = Some(Box::new(callback));
        self
    }

    pub fn abort_with<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) -> BoxFuture<'a, ()> + Send + Sync + 'a,
    {
        self.abort_with = Some(Box::new(callback));
        self
    }

    pub fn revert_with<F>(mut self, callback: F) -> Self
    where
        F: Fn(T) -> BoxFuture<'a, ()> + Send + Sync + 'a,
    {
        self.revert_with = Some(Box::new(callback));
        self
    }

    fn concurrency(&self) -> usize {
        self.pool.map(WorkerPool::concurrency).unwrap_or(1)
    }

    /// Run `task` over every item.
    ///
    /// Returns `Ok(true)` when every item succeeded and `Ok(false)` when some
    /// failed and rethrowing is off.
    pub async fn run<F>(self, task: F) -> Result<bool, E>
    where
        F: Fn(T) -> BoxFuture<'a, Result<(), E>> + Send + Sync,
    {
        let concurrency = self.concurrency();
        let stop = &AtomicBool::new(false);
        let task = &task;
        let on_failure = self.on_failure.as_ref();
        let pool = self.pool;
        let stop_on_failure = self.stop_on_failure;

        let mut slots: Vec<(usize, Slot<E>)> = stream::iter(self.items.iter().enumerate())
            .map(|(index, item)| async move {
                if stop_on_failure && stop.load(Ordering::Acquire) {
                    return (index, Slot::NotStarted);
                }
                let _permit = match pool {
                    Some(pool) => match pool.acquire().await {
                        Some(permit) => Some(permit),
                        None => return (index, Slot::NotStarted),
                    },
                    None => None,
                };
                if stop_on_failure && stop.load(Ordering::Acquire) {
                    return (index, Slot::NotStarted);
                }

                match task(item.clone()).await {
                    Ok(()) => (index, Slot::Succeeded),
                    Err(err) => {
                        stop.store(true, Ordering::Release);
                        if let Some(callback) = on_failure {
                            let handled = callback(item.clone(), &err);
                            handled.await;
                        }
                        (index, Slot::Failed(err))
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        slots.sort_by_key(|(index, _)| *index);

        let all_succeeded = slots
            .iter()
            .all(|(_, slot)| matches!(slot, Slot::Succeeded));

        if !all_succeeded {
            let succeeded = self.select(&slots, |slot| matches!(slot, Slot::Succeeded));
            let unfinished = self.select(&slots, |slot| !matches!(slot, Slot::Succeeded));
            warn!(
                items = slots.len(),
                succeeded = succeeded.len(),
                unfinished = unfinished.len(),
                "Batch had failures"
            );

            if let Some(revert) = &self.revert_with {
                Self::drive(succeeded, revert, concurrency).await;
            }
            if let Some(abort) = &self.abort_with {
                Self::drive(unfinished, abort, concurrency).await;
            }
        }

        let first_failure = slots.into_iter().find_map(|(_, slot)| match slot {
            Slot::Failed(err) => Some(err),
            _ => None,
        });

        match first_failure {
            Some(err) if self.rethrow => Err(err),
            _ => Ok(all_succeeded),
        }
    }

    fn select(&self, slots: &[(usize, Slot<E>)], keep: impl Fn(&Slot<E>) -> bool) -> Vec<T> {
        slots
            .iter()
            .filter(|(_, slot)| keep(slot))
            .map(|(index, _)| self.items[*index].clone())
            .collect()
    }

    /// Cleanup callbacks ignore the pool's shutdown state so they always run.
    async fn drive(items: Vec<T>, callback: &ItemCallback<'a, T>, concurrency: usize) {
        stream::iter(items)
            .map(|item| callback(item))
            .buffer_unordered(concurrency)
            .collect::<Vec<()>>()
            .await;
    }
}
