//! Bounded pool of reusable execution contexts.
//!
//! At most `capacity` contexts are checked out at once. Excess callers wait
//! on a fair semaphore, so slots are granted in FIFO order. A checked-out
//! context is wrapped in [`PooledContext`], which returns it to the idle
//! list (or discards it if unusable) on every exit path, including panics
//! and cancelled futures.

use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::AppError;
use crate::traits::{ContextFactory, ExecutionContext};

/// Future returned by a task submitted with [`ExecutionPool::submit`].
pub type ContextFuture<'c, T> = Pin<Box<dyn Future<Output = Result<T, AppError>> + Send + 'c>>;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum concurrently active contexts.
    pub capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { capacity: 2 }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub active: usize,
    pub idle: usize,
    pub waiting: usize,
    pub created: u64,
    pub discarded: u64,
}

struct PoolShared<C> {
    idle: Mutex<Vec<C>>,
    active: AtomicUsize,
    waiting: AtomicUsize,
    created: AtomicU64,
    discarded: AtomicU64,
}

impl<C> PoolShared<C> {
    fn lock_idle(&self) -> MutexGuard<'_, Vec<C>> {
        self.idle.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned pool mutex");
            poisoned.into_inner()
        })
    }
}

/// A context checked out of the pool. Dereferences to the context.
pub struct PooledContext<C: ExecutionContext> {
    context: Option<C>,
    discard: bool,
    shared: Arc<PoolShared<C>>,
    // Dropped after `Drop::drop` runs, so the context is idle again before
    // the next waiter is admitted.
    _permit: OwnedSemaphorePermit,
}

impl<C: ExecutionContext> PooledContext<C> {
    /// Marks the context for disposal instead of reuse, e.g. after a
    /// navigation timed out mid-flight.
    pub fn discard(&mut self) {
        self.discard = true;
    }
}

impl<C: ExecutionContext> Deref for PooledContext<C> {
    type Target = C;

    fn deref(&self) -> &C {
        match &self.context {
            Some(context) => context,
            None => unreachable!("pooled context is only taken on drop"),
        }
    }
}

impl<C: ExecutionContext> DerefMut for PooledContext<C> {
    fn deref_mut(&mut self) -> &mut C {
        match &mut self.context {
            Some(context) => context,
            None => unreachable!("pooled context is only taken on drop"),
        }
    }
}

impl<C: ExecutionContext> Drop for PooledContext<C> {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
        let Some(context) = self.context.take() else {
            return;
        };
        if self.discard || !context.is_usable() {
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Discarding execution context");
            return;
        }
        self.shared.lock_idle().push(context);
    }
}

/// Counts one caller queued for a slot for as long as it lives, including
/// when the `acquire` future is dropped mid-wait.
struct WaitingGuard<'a>(&'a AtomicUsize);

impl<'a> WaitingGuard<'a> {
    fn enter(waiting: &'a AtomicUsize) -> Self {
        waiting.fetch_add(1, Ordering::SeqCst);
        Self(waiting)
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Bounded pool of execution contexts created by a [`ContextFactory`].
pub struct ExecutionPool<F: ContextFactory> {
    factory: F,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    shared: Arc<PoolShared<F::Context>>,
}

impl<F: ContextFactory> ExecutionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        Self {
            factory,
            config: PoolConfig { capacity },
            permits: Arc::new(Semaphore::new(capacity)),
            shared: Arc::new(PoolShared {
                idle: Mutex::new(Vec::with_capacity(capacity)),
                active: AtomicUsize::new(0),
                waiting: AtomicUsize::new(0),
                created: AtomicU64::new(0),
                discarded: AtomicU64::new(0),
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Waits for a free slot until `deadline`, then hands out an idle
    /// context or creates a new one.
    ///
    /// Fails with `ResourceExhausted` when no slot frees up in time.
    pub async fn acquire(&self, deadline: Instant) -> Result<PooledContext<F::Context>, AppError> {
        let started = Instant::now();

        let waiting = WaitingGuard::enter(&self.shared.waiting);
        let permit =
            tokio::time::timeout_at(deadline, Arc::clone(&self.permits).acquire_owned()).await;
        drop(waiting);

        let permit = match permit {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(AppError::ResourceExhausted(
                    "execution pool is closed".into(),
                ));
            }
            Err(_elapsed) => {
                tracing::warn!(
                    capacity = self.config.capacity,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "No execution context freed up before the deadline"
                );
                return Err(AppError::ResourceExhausted(format!(
                    "all {} execution contexts busy until deadline",
                    self.config.capacity
                )));
            }
        };

        let reused = self.take_idle();
        let context = match reused {
            Some(context) => context,
            None => {
                let created = tokio::time::timeout_at(deadline, self.factory.create())
                    .await
                    .map_err(|_| AppError::timeout("context creation", started.elapsed()))??;
                self.shared.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Created execution context");
                created
            }
        };

        self.shared.active.fetch_add(1, Ordering::SeqCst);
        Ok(PooledContext {
            context: Some(context),
            discard: false,
            shared: Arc::clone(&self.shared),
            _permit: permit,
        })
    }

    fn take_idle(&self) -> Option<F::Context> {
        let mut idle = self.shared.lock_idle();
        while let Some(context) = idle.pop() {
            if context.is_usable() {
                return Some(context);
            }
            self.shared.discarded.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Runs `task` on a pooled context. The context is released when the
    /// task finishes, fails, or is dropped.
    pub async fn submit<T, Task>(&self, deadline: Instant, task: Task) -> Result<T, AppError>
    where
        Task: for<'c> FnOnce(&'c mut F::Context) -> ContextFuture<'c, T>,
    {
        let mut context = self.acquire(deadline).await?;
        task(&mut *context).await
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            capacity: self.config.capacity,
            active: self.shared.active.load(Ordering::SeqCst),
            idle: self.shared.lock_idle().len(),
            waiting: self.shared.waiting.load(Ordering::SeqCst),
            created: self.shared.created.load(Ordering::Relaxed),
            discarded: self.shared.discarded.load(Ordering::Relaxed),
        }
    }
}
