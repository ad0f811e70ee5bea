use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;

use super::error::{SourceResult, ValueResult};

/// Something that hands out a value, possibly producing it first.
#[async_trait]
pub trait ValueSource<T: Send + Sync + 'static>: Send + Sync {
    /// Returns the value if it is available right now.
    ///
    /// This never blocks and never produces the value.
    fn try_get(&self) -> Option<Arc<T>>;

    /// Returns the value, blocking the current thread while it is being produced.
    fn get(&self, cancel: &CancellationToken) -> ValueResult<Arc<T>>;

    /// Returns the value, suspending the current task while it is being produced.
    async fn get_async(&self, cancel: &CancellationToken) -> ValueResult<Arc<T>>;
}

/// A strategy producing a value from scratch or from previously persisted data.
///
/// A recovery may be invoked any number of times over the lifetime of a cell, every time the
/// previous value was reclaimed. It should observe `cancel` if producing the value takes long,
/// and return [`SourceError::Cancelled`](super::SourceError::Cancelled) when it fires.
pub trait RecoverySource<T: Send + Sync + 'static>: Send + Sync {
    /// Produces the value on the current thread.
    fn recover(&self, cancel: &CancellationToken) -> SourceResult<Arc<T>>;

    /// Produces the value asynchronously.
    ///
    /// Defaults to running [`recover`](Self::recover) inline.
    fn recover_async<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, SourceResult<Arc<T>>> {
        Box::pin(async move { self.recover(cancel) })
    }
}

/// A strategy persisting a value, so it can be recovered more cheaply later on.
pub trait SaveSource<T: Send + Sync + 'static>: Send + Sync {
    /// Persists `value`.
    ///
    /// On success, returns the recovery that reads the persisted form back.
    fn save<'a>(
        &'a self,
        value: Arc<T>,
    ) -> BoxFuture<'a, SourceResult<Arc<dyn RecoverySource<T>>>>;
}

impl<T, R> RecoverySource<T> for Arc<R>
where
    T: Send + Sync + 'static,
    R: RecoverySource<T> + ?Sized,
{
    fn recover(&self, cancel: &CancellationToken) -> SourceResult<Arc<T>> {
        (**self).recover(cancel)
    }

    fn recover_async<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, SourceResult<Arc<T>>> {
        (**self).recover_async(cancel)
    }
}

impl<T, S> SaveSource<T> for Arc<S>
where
    T: Send + Sync + 'static,
    S: SaveSource<T> + ?Sized,
{
    fn save<'a>(
        &'a self,
        value: Arc<T>,
    ) -> BoxFuture<'a, SourceResult<Arc<dyn RecoverySource<T>>>> {
        (**self).save(value)
    }
}

/// A [`RecoverySource`] backed by a closure, see [`recovery_fn`].
#[derive(Clone)]
pub struct RecoveryFn<F> {
    recover: F,
}

/// Creates a [`RecoverySource`] that runs `recover` for both blocking and async callers.
pub fn recovery_fn<T, F>(recover: F) -> RecoveryFn<F>
where
    F: Fn(&CancellationToken) -> SourceResult<T> + Send + Sync,
{
    RecoveryFn { recover }
}

impl<T, F> RecoverySource<T> for RecoveryFn<F>
where
    T: Send + Sync + 'static,
    F: Fn(&CancellationToken) -> SourceResult<T> + Send + Sync,
{
    fn recover(&self, cancel: &CancellationToken) -> SourceResult<Arc<T>> {
        (self.recover)(cancel).map(Arc::new)
    }
}

/// A [`RecoverySource`] with separate blocking and async implementations, see
/// [`recovery_fn_async`].
#[derive(Clone)]
pub struct AsyncRecoveryFn<S, A> {
    recover: S,
    recover_async: A,
}

/// Creates a [`RecoverySource`] from a blocking and an async closure.
///
/// Blocking callers run `recover`, async callers await the future returned by `recover_async`.
pub fn recovery_fn_async<T, S, A, Fut>(recover: S, recover_async: A) -> AsyncRecoveryFn<S, A>
where
    S: Fn(&CancellationToken) -> SourceResult<T> + Send + Sync,
    A: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = SourceResult<T>> + Send + 'static,
{
    AsyncRecoveryFn {
        recover,
        recover_async,
    }
}

impl<T, S, A, Fut> RecoverySource<T> for AsyncRecoveryFn<S, A>
where
    T: Send + Sync + 'static,
    S: Fn(&CancellationToken) -> SourceResult<T> + Send + Sync,
    A: Fn(CancellationToken) -> Fut + Send + Sync,
    Fut: Future<Output = SourceResult<T>> + Send + 'static,
{
    fn recover(&self, cancel: &CancellationToken) -> SourceResult<Arc<T>> {
        (self.recover)(cancel).map(Arc::new)
    }

    fn recover_async<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, SourceResult<Arc<T>>> {
        let recovered = (self.recover_async)(cancel.clone());
        Box::pin(async move { recovered.await.map(Arc::new) })
    }
}

/// A [`SaveSource`] backed by an async closure, see [`save_fn`].
#[derive(Clone)]
pub struct SaveFn<F> {
    save: F,
}

/// Creates a [`SaveSource`] from a closure.
///
/// The closure persists the value and resolves to the recovery that reads it back.
pub fn save_fn<T, F, Fut, R>(save: F) -> SaveFn<F>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync,
    Fut: Future<Output = SourceResult<R>> + Send + 'static,
    R: RecoverySource<T> + 'static,
{
    SaveFn { save }
}

impl<T, F, Fut, R> SaveSource<T> for SaveFn<F>
where
    T: Send + Sync + 'static,
    F: Fn(Arc<T>) -> Fut + Send + Sync,
    Fut: Future<Output = SourceResult<R>> + Send + 'static,
    R: RecoverySource<T> + 'static,
{
    fn save<'a>(
        &'a self,
        value: Arc<T>,
    ) -> BoxFuture<'a, SourceResult<Arc<dyn RecoverySource<T>>>> {
        let saved = (self.save)(value);
        Box::pin(async move {
            let recovery = saved.await?;
            Ok(Arc::new(recovery) as Arc<dyn RecoverySource<T>>)
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cell::SourceError;

    #[test]
    fn test_recovery_fn() {
        let calls = AtomicUsize::new(0);
        let recovery = recovery_fn(|_cancel: &CancellationToken| {
            calls.fetch_add(1, Ordering::Relaxed);
            Ok(String::from("recovered"))
        });

        let cancel = CancellationToken::new();
        assert_eq!(*recovery.recover(&cancel).unwrap(), "recovered");
        assert_eq!(*recovery.recover(&cancel).unwrap(), "recovered");
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn test_default_async_recovery_runs_inline() {
        let recovery = recovery_fn(|cancel: &CancellationToken| {
            if cancel.is_cancelled() {
                Err(SourceError::Cancelled)
            } else {
                Ok(1u32)
            }
        });

        let cancel = CancellationToken::new();
        assert_eq!(recovery.recover_async(&cancel).await, Ok(Arc::new(1)));
        cancel.cancel();
        assert_eq!(
            recovery.recover_async(&cancel).await,
            Err(SourceError::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_recovery_fn_async_picks_the_right_half() {
        let recovery = recovery_fn_async(
            |_cancel: &CancellationToken| Ok("blocking"),
            |_cancel| async { Ok("async") },
        );

        let cancel = CancellationToken::new();
        assert_eq!(*recovery.recover(&cancel).unwrap(), "blocking");
        assert_eq!(*recovery.recover_async(&cancel).await.unwrap(), "async");
    }

    #[tokio::test]
    async fn test_save_fn_returns_recovery() {
        let save = save_fn(|value: Arc<u64>| async move {
            let persisted = *value * 2;
            Ok(recovery_fn(move |_: &CancellationToken| Ok(persisted)))
        });

        let recovery = save.save(Arc::new(21)).await.unwrap();
        assert_eq!(*recovery.recover(&CancellationToken::new()).unwrap(), 42);
    }
}
