//! Helpers for testing cells and their services.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - [`services`] must be called from within a tokio runtime, as saves are spawned onto it. Values
//!    are not retained by these services, so a value is reclaimed as soon as the test drops it.
//!
//!  - [`CountingRecovery`] and [`RecordingSave`] are cheap to clone, and clones share their
//!    counters. Keep a clone around to inspect them after handing one to a cell.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use revive_service::cell::{RecoverySource, SaveSource, SourceError, SourceResult};
use revive_service::config::{Config, RetentionConfig};
use revive_service::services::CellServices;

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `revive_service` crate and mutes all
///    other logs.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("revive_service=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Creates services that do not retain any values, running saves on the current runtime.
pub fn services() -> CellServices {
    services_with(Config {
        retention: RetentionConfig {
            capacity: 0,
            ..RetentionConfig::default()
        },
        ..Config::default()
    })
}

/// Creates services from `config`, running saves on the current runtime.
pub fn services_with(config: Config) -> CellServices {
    CellServices::new(config, tokio::runtime::Handle::current()).unwrap()
}

/// Consumes one pending induced failure, if there is any left.
fn take_failure(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// A recovery producing clones of a fixed value, counting how often it runs.
#[derive(Clone, Debug)]
pub struct CountingRecovery<T> {
    value: T,
    delay: Duration,
    failures: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl<T> CountingRecovery<T> {
    pub fn new(value: T) -> Self {
        Self {
            value,
            delay: Duration::ZERO,
            failures: Default::default(),
            calls: Default::default(),
        }
    }

    /// Makes every recovery take `delay` before it produces the value.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the next `times` recoveries fail with [`SourceError::Unavailable`].
    pub fn failing(self, times: usize) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }

    /// The number of times a recovery was started, including failed and cancelled ones.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn start(&self) -> SourceResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if take_failure(&self.failures) {
            return Err(SourceError::Unavailable("induced recovery failure".into()));
        }
        Ok(())
    }
}

impl<T: Clone + Send + Sync + 'static> RecoverySource<T> for CountingRecovery<T> {
    fn recover(&self, cancel: &CancellationToken) -> SourceResult<Arc<T>> {
        self.start()?;
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(Arc::new(self.value.clone()))
    }

    fn recover_async<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, SourceResult<Arc<T>>> {
        Box::pin(async move {
            self.start()?;
            tokio::select! {
                _ = cancel.cancelled() => Err(SourceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(Arc::new(self.value.clone())),
            }
        })
    }
}

/// A save that records copies of the values it was asked to persist.
///
/// A successful save returns a [`CountingRecovery`] of the saved copy. All recoveries handed out
/// by one `RecordingSave` share a single counter, see [`saved_recoveries`](Self::saved_recoveries).
#[derive(Clone, Debug)]
pub struct RecordingSave<T> {
    saved: Arc<Mutex<Vec<T>>>,
    delay: Duration,
    failures: Arc<AtomicUsize>,
    saved_recoveries: Arc<AtomicUsize>,
}

impl<T: Clone> RecordingSave<T> {
    pub fn new() -> Self {
        Self {
            saved: Default::default(),
            delay: Duration::ZERO,
            failures: Default::default(),
            saved_recoveries: Default::default(),
        }
    }

    /// Makes every save take `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Makes the next `times` saves fail with [`SourceError::Unavailable`].
    pub fn failing(self, times: usize) -> Self {
        self.failures.store(times, Ordering::SeqCst);
        self
    }

    /// Copies of all successfully saved values, in the order they were saved.
    pub fn saved(&self) -> Vec<T> {
        self.saved.lock().unwrap().clone()
    }

    /// The number of successful saves.
    pub fn saves(&self) -> usize {
        self.saved.lock().unwrap().len()
    }

    /// The number of times any recovery returned by this save ran.
    pub fn saved_recoveries(&self) -> usize {
        self.saved_recoveries.load(Ordering::SeqCst)
    }
}

impl<T: Clone> Default for RecordingSave<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> SaveSource<T> for RecordingSave<T> {
    fn save<'a>(
        &'a self,
        value: Arc<T>,
    ) -> BoxFuture<'a, SourceResult<Arc<dyn RecoverySource<T>>>> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if take_failure(&self.failures) {
                return Err(SourceError::Unavailable("induced save failure".into()));
            }

            let copy = T::clone(&value);
            self.saved.lock().unwrap().push(copy.clone());

            let recovery = CountingRecovery {
                value: copy,
                delay: Duration::ZERO,
                failures: Default::default(),
                calls: Arc::clone(&self.saved_recoveries),
            };
            Ok(Arc::new(recovery) as Arc<dyn RecoverySource<T>>)
        })
    }
}
