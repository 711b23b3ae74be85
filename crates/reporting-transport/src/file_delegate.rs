//! File-backed persistence delegate.

use crate::error::{TransportError, TransportResult};
use reporting_core::{ReportingDelegate, ReportingError, ReportingResult};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::debug;

/// Stores the persisted cache in a single file.
///
/// Writes go to a sibling temp file that is synced and renamed over the
/// target, so a crash mid-write leaves the previous state intact.
#[derive(Debug, Clone)]
pub struct FileDelegate {
    path: PathBuf,
}

impl FileDelegate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ReportingDelegate for FileDelegate {
    fn load_persisted_state(&self) -> ReportingResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => {
                debug!(path = %self.path.display(), bytes = bytes.len(), "Loaded persisted state");
                Ok(Some(bytes))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ReportingError::Io(e)),
        }
    }

    fn persist_state(&self, blob: Vec<u8>) -> ReportingResult<()> {
        atomic_write(&self.path, &blob).map_err(|e| match e {
            TransportError::Io(e) => ReportingError::Io(e),
            other => ReportingError::Persistence(other.to_string()),
        })?;
        debug!(path = %self.path.display(), bytes = blob.len(), "Persisted state");
        Ok(())
    }
}

fn atomic_write(path: &Path, content: &[u8]) -> TransportResult<()> {
    let dir = path
        .parent()
        .ok_or_else(|| TransportError::InvalidPath(path.display().to_string()))?;
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| TransportError::InvalidPath(path.display().to_string()))?;

    if !dir.as_os_str().is_empty() {
        fs::create_dir_all(dir)?;
    }

    let tmp_name = format!(
        ".{}.tmp.{}",
        file_name,
        std::time::SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
    );
    let tmp_path = dir.join(tmp_name);

    let write_result = (|| -> io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)?;

        if let Ok(parent_dir) = fs::File::open(dir) {
            let _ = parent_dir.sync_all();
        }
        Ok(())
    })();

    if let Err(err) = write_result {
        let _ = fs::remove_file(&tmp_path);
        return Err(err.into());
    }
    Ok(())
}
