//! Provides the shared revive services and a way to initialize them.
//!
//! [`CellServices`] owns the process-wide pieces every cell needs, the [`Retainer`] deciding how
//! long values stay in memory and the [`SaveQueue`] serializing all saves, and hands out cells
//! wired up with them according to the provided [`Config`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::cell::{CellBuilder, RecoverySource, Retainer, SaveQueue, SaveSource, ValueCell};
use crate::config::Config;

#[derive(Debug)]
pub struct CellServices {
    pub config: Config,
    pub retainer: Retainer,
    pub save_queue: Arc<SaveQueue>,
}

impl CellServices {
    /// Creates the services, running saves on `runtime`.
    pub fn new(config: Config, runtime: tokio::runtime::Handle) -> Result<Self> {
        if config.cells.lock_timeout == Some(Duration::ZERO) {
            anyhow::bail!("cell lock timeout must not be zero");
        }

        let retainer = match config.retention.capacity {
            0 => Retainer::disabled(),
            _ => Retainer::new(&config.retention),
        };
        let save_queue = Arc::new(SaveQueue::new(&config.save_queue, runtime));

        Ok(Self {
            config,
            retainer,
            save_queue,
        })
    }

    /// Starts building a cell with the configured defaults.
    pub fn builder<T: Send + Sync + 'static>(
        &self,
        recovery: impl RecoverySource<T> + 'static,
    ) -> CellBuilder<T> {
        CellBuilder::new(recovery, Arc::clone(&self.save_queue), self.retainer.clone())
            .lock_timeout(self.config.cells.lock_timeout)
    }

    /// Creates a cell that recovers through `recovery` and never saves.
    pub fn cell<T: Send + Sync + 'static>(
        &self,
        recovery: impl RecoverySource<T> + 'static,
    ) -> ValueCell<T> {
        self.builder(recovery).build()
    }

    /// Creates a cell that saves its first value through `save`.
    pub fn saving_cell<T: Send + Sync + 'static>(
        &self,
        recovery: impl RecoverySource<T> + 'static,
        save: impl SaveSource<T> + 'static,
    ) -> ValueCell<T> {
        self.builder(recovery).save(save).build()
    }
}
