//! Engine assembly: opens the device, discovers volumes, harvests their
//! MFTs, builds the catalogue, and owns the tap lifecycle.
//!
//! Everything the components share travels through this context instead of
//! process globals: the device sits behind one mutex that serialises
//! seek+read pairs once the tap threads exist, and the catalogue is
//! read-only after bootstrap.

use crate::catalog::{self, FileCatalog};
use crate::device::BlockDevice;
use crate::error::NtfsError;
use crate::extract::{ExtractOutcome, Extractor};
use crate::harvest::{self, Volume};
use crate::layout::{self, RECORD_SIZE, SECTOR_SIZE};
use crate::record;
use crate::tap::{TapConsumer, TapQueue, TapServer, TapWorkerContext};
use anyhow::Context;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Startup configuration, resolved from the command line.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub device_path: PathBuf,
    pub image_dir: PathBuf,
    pub output_root: PathBuf,
    pub max_extract_size: u64,
    pub max_modify_age_secs: u64,
    pub socket_name: String,
}

/// The assembled engine. Harvest and catalogue are complete before this
/// exists; the tap consumer is the only part started and stopped later.
pub struct Engine {
    device: Arc<Mutex<BlockDevice>>,
    volumes: Vec<Volume>,
    catalog: FileCatalog,
    extractor: Arc<Extractor>,
    queue: Arc<TapQueue>,
    server: Option<TapServer>,
    consumer: Option<TapConsumer>,
    max_age_ticks: u64,
}

impl Engine {
    /// Runs the startup sequence: open the device read-only, discover the
    /// NTFS partitions, harvest each volume's MFT into a local image, and
    /// sweep the images into one catalogue. The tap socket starts
    /// listening here too; its consumer waits for `start_server`.
    pub fn bootstrap(options: &EngineOptions) -> anyhow::Result<Self> {
        let mut device = BlockDevice::open(&options.device_path).with_context(|| {
            format!("failed to open device {}", options.device_path.display())
        })?;

        let volumes = harvest::discover_ntfs_volumes(&mut device)
            .context("no usable NTFS partition on the device")?;

        let mut catalog = FileCatalog::default();
        for volume in &volumes {
            let summary = harvest::harvest_mft(&mut device, volume, &options.image_dir)
                .with_context(|| {
                    format!("MFT harvest failed on partition {}", volume.partition_index)
                })?;
            let volume_catalog = catalog::build_catalog(&summary.image_path, volume)
                .with_context(|| {
                    format!(
                        "catalogue build failed on {}",
                        summary.image_path.display()
                    )
                })?;
            catalog.merge(volume_catalog);
        }

        let device = Arc::new(Mutex::new(device));
        let extractor = Arc::new(Extractor::new(
            Arc::clone(&device),
            options.output_root.clone(),
            options.max_extract_size,
        ));

        let queue = Arc::new(TapQueue::new());
        let server = match TapServer::start(&options.socket_name, Arc::clone(&queue)) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!(error = %e, "disk tap socket unavailable, tap disabled");
                None
            }
        };

        Ok(Self {
            device,
            volumes,
            catalog,
            extractor,
            queue,
            server,
            consumer: None,
            max_age_ticks: options.max_modify_age_secs * layout::NTFS_TICKS_PER_SECOND,
        })
    }

    pub fn catalog(&self) -> &FileCatalog {
        &self.catalog
    }

    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    pub fn partition_summary(&self) -> String {
        let mut out = String::new();
        for volume in &self.volumes {
            out.push_str(&volume.describe());
            out.push('\n');
        }
        if let Some(name) = self.catalog.volume_name() {
            out.push_str(&format!("volume name: {name}\n"));
        }
        out
    }

    pub fn tap_running(&self) -> bool {
        self.consumer.is_some()
    }

    /// Spawns the tap consumer. No-op when it is already running.
    pub fn start_server(&mut self) -> Result<(), &'static str> {
        if self.server.is_none() {
            return Err("tap socket is not listening");
        }
        if self.consumer.is_some() {
            return Err("tap consumer already running");
        }

        let ctx = TapWorkerContext {
            device: Arc::clone(&self.device),
            volumes: self.volumes.clone(),
            extractor: Arc::clone(&self.extractor),
            max_age_ticks: self.max_age_ticks,
        };
        self.consumer = Some(TapConsumer::spawn(Arc::clone(&self.queue), ctx));
        Ok(())
    }

    /// Cancels and joins the tap consumer.
    pub fn stop_server(&mut self) -> Result<(), &'static str> {
        match self.consumer.take() {
            Some(consumer) => {
                consumer.stop();
                Ok(())
            }
            None => Err("tap consumer is not running"),
        }
    }

    /// Extracts the file catalogued under the given record number.
    pub fn extract_by_record(
        &self,
        record_number: u32,
    ) -> Result<Option<ExtractOutcome>, NtfsError> {
        let Some(entry) = self.catalog.search_by_record(record_number).first().copied()
        else {
            return Ok(None);
        };
        self.extract_at_sector(entry.sector_offset).map(Some)
    }

    /// Re-reads the MFT record at the given absolute sector and extracts
    /// its data. This is the manual twin of the tap path, minus the
    /// recency filter.
    pub fn extract_at_sector(&self, sector: i64) -> Result<ExtractOutcome, NtfsError> {
        if sector < 0 {
            return Err(NtfsError::Malformed("negative sector offset"));
        }
        let byte_offset = sector as u64 * SECTOR_SIZE;
        let volume = self
            .volumes
            .iter()
            .find(|v| v.contains_byte(byte_offset))
            .ok_or(NtfsError::Malformed("sector outside any NTFS volume"))?;

        let buf = {
            let mut device = self.device.lock();
            device.read_vec_at(byte_offset, RECORD_SIZE)?
        };
        let decoded = record::decode_record(&buf)?;
        self.extractor.extract_record_data(&decoded, volume, None)
    }

    /// Stops whatever is still running and releases the device.
    pub fn shutdown(mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.stop();
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}
