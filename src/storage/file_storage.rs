use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, error, info};

use crate::acquisition::plan::WORD_SIZE;
use crate::data_capture::file_sink::SequentialFileSink;
use crate::data_capture::types::{CaptureReport, SampleBlock};
use crate::error_handling::types::PersistenceError;

const METADATA_SUFFIX: &str = ".meta.json";

/// Filesystem layout of one capture: the raw data file and its JSON metadata sidecar
/// (`<data file>.meta.json`).
pub struct CaptureStorage {
    data_path: PathBuf,
}

impl CaptureStorage {
    pub fn new<P: AsRef<Path>>(data_path: P) -> Self {
        Self {
            data_path: data_path.as_ref().to_path_buf(),
        }
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn metadata_path(&self) -> PathBuf {
        let mut name = self
            .data_path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(METADATA_SUFFIX);
        self.data_path.with_file_name(name)
    }

    /// Creates the parent directory if needed.
    pub fn prepare(&self) -> Result<(), PersistenceError> {
        match self.data_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => {
                fs::create_dir_all(dir).map_err(|e| {
                    error!("Failed to create capture dir {}: {}", dir.display(), e);
                    PersistenceError::CreateFailed(dir.to_path_buf(), e)
                })
            }
            _ => Ok(()),
        }
    }

    /// Creates the capture file and its sink.
    pub fn create_sink(&self) -> Result<SequentialFileSink, PersistenceError> {
        self.prepare()?;
        let sink = SequentialFileSink::create(&self.data_path).map_err(|e| {
            error!("Failed to create capture file {}: {}", self.data_path.display(), e);
            e
        })?;
        info!("Capturing to {}", self.data_path.display());
        Ok(sink)
    }

    pub fn save_report(&self, report: &CaptureReport) -> Result<PathBuf, PersistenceError> {
        let path = self.metadata_path();
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| PersistenceError::MetadataFailed(e.to_string()))?;
        fs::write(&path, json).map_err(|e| {
            error!("Failed to write capture metadata {}: {}", path.display(), e);
            PersistenceError::WriteFailed(e)
        })?;
        info!("Saved capture report {} to {}", report.session_id, path.display());
        Ok(path)
    }

    pub fn load_report(&self) -> Result<CaptureReport, PersistenceError> {
        let path = self.metadata_path();
        let json = fs::read_to_string(&path).map_err(|e| {
            error!("Failed to read capture metadata {}: {}", path.display(), e);
            PersistenceError::ReadFailed(path.clone(), e)
        })?;
        let report = serde_json::from_str(&json).map_err(|e| {
            error!("Invalid capture metadata in {}: {}", path.display(), e);
            PersistenceError::MetadataFailed(e.to_string())
        })?;
        debug!("Loaded capture report from {}", path.display());
        Ok(report)
    }

    pub fn load_raw(&self) -> Result<Vec<u8>, PersistenceError> {
        fs::read(&self.data_path).map_err(|e| {
            error!("Failed to read capture file {}: {}", self.data_path.display(), e);
            PersistenceError::ReadFailed(self.data_path.clone(), e)
        })
    }

    /// Reads the capture file back as tixels of `channel_count` words.
    pub fn load_samples(&self, channel_count: usize) -> Result<SampleBlock, PersistenceError> {
        let raw = self.load_raw()?;
        if raw.len() % WORD_SIZE != 0 {
            debug!(
                "Capture file {} ends on a partial word",
                self.data_path.display()
            );
        }
        let words = raw
            .chunks_exact(WORD_SIZE)
            .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        Ok(SampleBlock::new(words, channel_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::plan::AcquisitionPlan;
    use crate::configuration::types::CaptureMode;
    use crate::data_capture::sink::Sink;
    use crate::data_capture::types::CaptureOutcome;
    use crate::transfer::types::PoolStats;
    use chrono::Utc;
    use tempfile::tempdir;
    use uuid::Uuid;

    fn report() -> CaptureReport {
        let plan = AcquisitionPlan::new(1.0, 300.0, 1, 512, 8).unwrap();
        CaptureReport {
            session_id: Uuid::new_v4(),
            mode: CaptureMode::File,
            started_at: Utc::now(),
            finished_at: Utc::now(),
            elapsed_ms: 1200,
            expected_packets: plan.total_packet_count(),
            received_packets: 2,
            expected_bytes: plan.total_bytes(),
            received_bytes: 1024,
            plan,
            stats: PoolStats::default(),
            abandoned_slots: 0,
            ring: None,
            outcome: CaptureOutcome::Partial,
        }
    }

    #[test]
    fn test_metadata_path() {
        let storage = CaptureStorage::new("/data/run1/capture.dat");
        assert_eq!(
            storage.metadata_path(),
            PathBuf::from("/data/run1/capture.dat.meta.json")
        );
    }

    #[test]
    fn test_sink_creates_parent_dirs_and_samples_reload() {
        let dir = tempdir().unwrap();
        let storage = CaptureStorage::new(dir.path().join("nested/run/capture.dat"));
        let mut sink = storage.create_sink().unwrap();
        let words: Vec<u8> = (0..6i32).flat_map(|w| w.to_le_bytes()).collect();
        sink.write(&words, 0, 1).unwrap();
        sink.finish().unwrap();

        let block = storage.load_samples(2).unwrap();
        assert_eq!(block.samples(), 3);
        assert_eq!(block.row(2), Some(&[4, 5][..]));
        assert_eq!(storage.load_raw().unwrap(), words);
    }

    #[test]
    fn test_report_round_trip() {
        let dir = tempdir().unwrap();
        let storage = CaptureStorage::new(dir.path().join("capture.dat"));
        let original = report();
        let path = storage.save_report(&original).unwrap();
        assert!(path.exists());

        let loaded = storage.load_report().unwrap();
        assert_eq!(loaded, original);
        assert_eq!(loaded.missing_packets(), 1);
        assert_eq!(loaded.missing_bytes(), 176);
    }

    #[test]
    fn test_missing_files() {
        let dir = tempdir().unwrap();
        let storage = CaptureStorage::new(dir.path().join("absent.dat"));
        assert!(matches!(
            storage.load_report(),
            Err(PersistenceError::ReadFailed(_, _))
        ));
        assert!(matches!(
            storage.load_samples(4),
            Err(PersistenceError::ReadFailed(_, _))
        ));

        fs::write(storage.metadata_path(), "{ not json").unwrap();
        assert!(matches!(
            storage.load_report(),
            Err(PersistenceError::MetadataFailed(_))
        ));
    }
}
