use std::fmt;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use super::error::{SourceResult, ValueError, ValueResult};
use super::source::{RecoverySource, ValueSource};

/// A value source that always holds on to its value.
///
/// It doubles as a [`RecoverySource`] that "recovers" by handing out the held value, which is
/// handy for values that are already in memory anyway.
pub struct ConstantValueSource<T> {
    value: Arc<T>,
}

impl<T> ConstantValueSource<T> {
    pub fn new(value: T) -> Self {
        Self::from_arc(Arc::new(value))
    }

    pub fn from_arc(value: Arc<T>) -> Self {
        Self { value }
    }

    pub fn value(&self) -> &Arc<T> {
        &self.value
    }
}

impl<T> Clone for ConstantValueSource<T> {
    fn clone(&self) -> Self {
        Self {
            value: Arc::clone(&self.value),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ConstantValueSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ConstantValueSource")
            .field(&self.value)
            .finish()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> ValueSource<T> for ConstantValueSource<T> {
    fn try_get(&self) -> Option<Arc<T>> {
        Some(Arc::clone(&self.value))
    }

    fn get(&self, _cancel: &CancellationToken) -> ValueResult<Arc<T>> {
        Ok(Arc::clone(&self.value))
    }

    async fn get_async(&self, _cancel: &CancellationToken) -> ValueResult<Arc<T>> {
        Ok(Arc::clone(&self.value))
    }
}

impl<T: Send + Sync + 'static> RecoverySource<T> for ConstantValueSource<T> {
    fn recover(&self, _cancel: &CancellationToken) -> SourceResult<Arc<T>> {
        Ok(Arc::clone(&self.value))
    }
}

/// A value source that only references its value weakly.
///
/// Once every strong reference is gone, the value is lost for good and accessing it fails with
/// [`ValueError::Reclaimed`].
pub struct WeakValueSource<T> {
    value: Weak<T>,
}

impl<T> WeakValueSource<T> {
    pub fn new(value: &Arc<T>) -> Self {
        Self {
            value: Arc::downgrade(value),
        }
    }

    /// Whether the value was reclaimed.
    pub fn is_reclaimed(&self) -> bool {
        self.value.strong_count() == 0
    }
}

impl<T> Clone for WeakValueSource<T> {
    fn clone(&self) -> Self {
        Self {
            value: Weak::clone(&self.value),
        }
    }
}

impl<T> fmt::Debug for WeakValueSource<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakValueSource")
            .field("reclaimed", &self.is_reclaimed())
            .finish()
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> ValueSource<T> for WeakValueSource<T> {
    fn try_get(&self) -> Option<Arc<T>> {
        self.value.upgrade()
    }

    fn get(&self, _cancel: &CancellationToken) -> ValueResult<Arc<T>> {
        self.value.upgrade().ok_or(ValueError::Reclaimed)
    }

    async fn get_async(&self, cancel: &CancellationToken) -> ValueResult<Arc<T>> {
        self.get(cancel)
    }
}
