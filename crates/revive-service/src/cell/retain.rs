use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::config::RetentionConfig;

use super::recoverable::CellId;

/// A strong handle kept alive on behalf of a cell.
#[derive(Clone)]
struct Retained {
    #[allow(dead_code)] // only held to keep the value alive
    value: Arc<dyn Any + Send + Sync>,
    weight: u32,
}

type RetentionCache = moka::sync::Cache<CellId, Retained>;

/// Decides how long recovered values stay in memory.
///
/// Cells only hold weak references to their values. Without anybody else holding on to a value,
/// it is freed as soon as the last caller drops it. The retainer keeps strong handles to
/// recently produced values within a weight budget, and drops them again when they are idle for
/// too long or when the budget is exceeded. Dropping the handle is what makes a value reclaimable.
///
/// The retainer is cheap to clone. All clones share the same budget.
#[derive(Clone)]
pub struct Retainer {
    cache: Option<RetentionCache>,
}

impl Retainer {
    pub fn new(config: &RetentionConfig) -> Self {
        let mut builder = RetentionCache::builder()
            .name("retention")
            .max_capacity(config.capacity)
            // the bookkeeping for each entry is counted towards its weight
            .weigher(|_id, retained: &Retained| {
                (std::mem::size_of::<(CellId, Retained)>() as u32).saturating_add(retained.weight)
            });
        if let Some(time_to_idle) = config.time_to_idle {
            builder = builder.time_to_idle(time_to_idle);
        }
        if let Some(time_to_live) = config.time_to_live {
            builder = builder.time_to_live(time_to_live);
        }

        Self {
            cache: Some(builder.build()),
        }
    }

    /// A retainer that never keeps anything alive.
    ///
    /// Values then live exactly as long as some caller holds them.
    pub fn disabled() -> Self {
        Self { cache: None }
    }

    /// Keeps `value` alive on behalf of the cell `id`, replacing whatever was retained for it.
    pub fn retain(&self, id: CellId, value: Arc<dyn Any + Send + Sync>, weight: u32) {
        if let Some(cache) = &self.cache {
            cache.insert(id, Retained { value, weight });
        }
    }

    /// Records an access to the value retained for `id`, refreshing its idle timer.
    pub fn touch(&self, id: CellId) {
        if let Some(cache) = &self.cache {
            cache.get(&id);
        }
    }

    /// Stops retaining the value of `id`.
    ///
    /// The handle may be dropped lazily, use [`evict`](Self::evict) to drop it right away.
    pub fn release(&self, id: CellId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&id);
        }
    }

    /// Drops the value retained for `id` right away.
    pub fn evict(&self, id: CellId) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&id);
            cache.run_pending_tasks();
        }
    }

    /// Drops every retained value right away, as if the process came under memory pressure.
    pub fn evict_all(&self) {
        if let Some(cache) = &self.cache {
            for (id, _) in cache.iter() {
                cache.invalidate(&*id);
            }
            cache.run_pending_tasks();
        }
    }

    /// The number of values currently retained.
    pub fn retained_count(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks();
                cache.entry_count()
            }
            None => 0,
        }
    }

    /// The total weight of all retained values, including bookkeeping.
    pub fn retained_weight(&self) -> u64 {
        match &self.cache {
            Some(cache) => {
                cache.run_pending_tasks();
                cache.weighted_size()
            }
            None => 0,
        }
    }
}

impl fmt::Debug for Retainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.cache {
            Some(cache) => f
                .debug_struct("Retainer")
                .field("retained", &cache.entry_count())
                .field("weight", &cache.weighted_size())
                .finish(),
            None => f.write_str("Retainer(disabled)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Weak;
    use std::time::Duration;

    use super::*;

    fn config() -> RetentionConfig {
        RetentionConfig {
            capacity: 1024 * 1024,
            time_to_idle: None,
            time_to_live: None,
        }
    }

    fn retain_new(retainer: &Retainer, id: u64) -> Weak<String> {
        let value = Arc::new(format!("value {id}"));
        let weak = Arc::downgrade(&value);
        retainer.retain(CellId(id), value, 16);
        weak
    }

    #[test]
    fn test_retain_and_evict() {
        let retainer = Retainer::new(&config());

        let first = retain_new(&retainer, 1);
        let second = retain_new(&retainer, 2);
        assert_eq!(retainer.retained_count(), 2);
        assert!(first.upgrade().is_some());

        retainer.evict(CellId(1));
        assert!(first.upgrade().is_none());
        assert!(second.upgrade().is_some());

        retainer.evict_all();
        assert!(second.upgrade().is_none());
        assert_eq!(retainer.retained_count(), 0);
    }

    #[test]
    fn test_replacing_drops_the_old_value() {
        let retainer = Retainer::new(&config());

        let old = retain_new(&retainer, 1);
        let new = retain_new(&retainer, 1);
        retainer.retained_count();

        assert!(old.upgrade().is_none());
        assert!(new.upgrade().is_some());
    }

    #[test]
    fn test_capacity_bounds_retention() {
        let retainer = Retainer::new(&RetentionConfig {
            capacity: 1000,
            ..config()
        });

        let values: Vec<_> = (0..100).map(|id| retain_new(&retainer, id)).collect();
        let weight = retainer.retained_weight();
        let alive = values.iter().filter(|v| v.upgrade().is_some()).count();

        assert!(weight <= 1000, "retained weight {weight} exceeds capacity");
        assert!(alive < values.len());
    }

    #[test]
    fn test_idle_values_are_dropped() {
        let retainer = Retainer::new(&RetentionConfig {
            time_to_idle: Some(Duration::from_millis(20)),
            ..config()
        });

        let value = retain_new(&retainer, 1);
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(retainer.retained_count(), 0);
        assert!(value.upgrade().is_none());
    }

    #[test]
    fn test_disabled() {
        let retainer = Retainer::disabled();

        let value = retain_new(&retainer, 1);
        assert!(value.upgrade().is_none());
        assert_eq!(retainer.retained_count(), 0);
    }
}
