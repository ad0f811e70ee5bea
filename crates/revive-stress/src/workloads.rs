use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail, ensure};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tempfile::{NamedTempFile, TempDir};
use tokio_util::sync::CancellationToken;

use revive_service::cell::{
    RecoverySource, Retainer, SaveSource, SourceError, SourceResult, ValueCell, ValueSource,
};
use revive_service::services::CellServices;

#[derive(Debug, Deserialize, Serialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Workload {
    pub concurrency: usize,
    /// The number of cells the accesses are spread over.
    pub cells: usize,
    /// The size of every value in bytes.
    pub payload_size: usize,
    /// How long producing a value from scratch takes.
    #[serde(default, with = "humantime_serde")]
    pub recovery_delay: Duration,
    #[serde(default)]
    pub save: SaveMode,
    /// Evicts the accessed cell's value after every n-th access.
    #[serde(default)]
    pub evict_every: Option<usize>,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveMode {
    #[default]
    None,
    Tempfile,
}

/// The value every cell of the stresstest holds.
#[derive(Debug, Deserialize, Serialize)]
pub struct Payload {
    pub cell: usize,
    pub bytes: Vec<u8>,
}

fn payload_weight(payload: &Payload) -> u32 {
    payload.bytes.len().try_into().unwrap_or(u32::MAX)
}

/// Produces a payload from scratch, taking a configurable amount of time.
struct GeneratedRecovery {
    cell: usize,
    size: usize,
    delay: Duration,
}

impl GeneratedRecovery {
    fn generate(&self) -> Arc<Payload> {
        let bytes = (0..self.size).map(|i| (i ^ self.cell) as u8).collect();
        Arc::new(Payload {
            cell: self.cell,
            bytes,
        })
    }
}

impl RecoverySource<Payload> for GeneratedRecovery {
    fn recover(&self, cancel: &CancellationToken) -> SourceResult<Arc<Payload>> {
        std::thread::sleep(self.delay);
        if cancel.is_cancelled() {
            return Err(SourceError::Cancelled);
        }
        Ok(self.generate())
    }

    fn recover_async<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, SourceResult<Arc<Payload>>> {
        Box::pin(async move {
            tokio::select! {
                _ = cancel.cancelled() => Err(SourceError::Cancelled),
                _ = tokio::time::sleep(self.delay) => Ok(self.generate()),
            }
        })
    }
}

/// Persists payloads as JSON into temporary files.
struct TempfileSave {
    dir: Arc<TempDir>,
}

impl SaveSource<Payload> for TempfileSave {
    fn save<'a>(
        &'a self,
        value: Arc<Payload>,
    ) -> BoxFuture<'a, SourceResult<Arc<dyn RecoverySource<Payload>>>> {
        let dir = Arc::clone(&self.dir);
        Box::pin(async move {
            let file = tokio::task::spawn_blocking(move || -> SourceResult<NamedTempFile> {
                let mut file = NamedTempFile::new_in(dir.path())?;
                let mut writer = BufWriter::new(file.as_file_mut());
                serde_json::to_writer(&mut writer, &*value)?;
                writer.flush()?;
                drop(writer);
                Ok(file)
            })
            .await
            .map_err(SourceError::from_std_error)??;

            Ok(Arc::new(TempfileRecovery { file }) as Arc<dyn RecoverySource<Payload>>)
        })
    }
}

/// Reads a saved payload back. The file is deleted together with the recovery.
struct TempfileRecovery {
    file: NamedTempFile,
}

fn read_payload(path: &Path) -> SourceResult<Arc<Payload>> {
    let reader = BufReader::new(File::open(path)?);
    let payload: Payload = serde_json::from_reader(reader)?;
    Ok(Arc::new(payload))
}

impl RecoverySource<Payload> for TempfileRecovery {
    fn recover(&self, _cancel: &CancellationToken) -> SourceResult<Arc<Payload>> {
        read_payload(self.file.path())
    }

    fn recover_async<'a>(
        &'a self,
        _cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, SourceResult<Arc<Payload>>> {
        let path = self.file.path().to_owned();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || read_payload(&path))
                .await
                .map_err(SourceError::from_std_error)?
        })
    }
}

pub struct PreparedWorkload {
    pub concurrency: usize,
    cells: Vec<ValueCell<Payload>>,
    payload_size: usize,
    evict_every: Option<usize>,
    accesses: AtomicUsize,
    retainer: Retainer,
    // saved payloads live here until the workload is done
    _dir: Option<Arc<TempDir>>,
}

impl PreparedWorkload {
    /// The number of cells whose first value has been saved.
    pub fn saved_cells(&self) -> usize {
        self.cells.iter().filter(|cell| cell.is_saved()).count()
    }
}

pub fn prepare_workload(services: &CellServices, workload: Workload) -> Result<PreparedWorkload> {
    if workload.cells == 0 {
        bail!("a workload needs at least one cell");
    }
    if workload.evict_every == Some(0) {
        bail!("`evict_every` must be greater than zero");
    }

    let dir = match workload.save {
        SaveMode::None => None,
        SaveMode::Tempfile => Some(Arc::new(
            tempfile::tempdir().context("failed to create the save directory")?,
        )),
    };

    let cells = (0..workload.cells)
        .map(|cell| {
            let recovery = GeneratedRecovery {
                cell,
                size: workload.payload_size,
                delay: workload.recovery_delay,
            };
            let builder = services
                .builder(recovery)
                .name("stresstest")
                .weigher(payload_weight);
            match &dir {
                Some(dir) => builder.save(TempfileSave {
                    dir: Arc::clone(dir),
                }),
                None => builder,
            }
            .build()
        })
        .collect();

    Ok(PreparedWorkload {
        concurrency: workload.concurrency,
        cells,
        payload_size: workload.payload_size,
        evict_every: workload.evict_every,
        accesses: AtomicUsize::new(0),
        retainer: services.retainer.clone(),
        _dir: dir,
    })
}

/// Accesses the next cell of the workload, round-robin.
pub async fn process_workload(workload: &PreparedWorkload) -> Result<()> {
    let access = workload.accesses.fetch_add(1, Ordering::Relaxed);
    let index = access % workload.cells.len();
    let cell = &workload.cells[index];

    let payload = cell.get_async(&CancellationToken::new()).await?;
    ensure!(
        payload.cell == index && payload.bytes.len() == workload.payload_size,
        "{} returned a foreign payload",
        cell.id()
    );

    if workload.evict_every.is_some_and(|every| access % every == 0) {
        workload.retainer.evict(cell.id());
    }

    Ok(())
}
