use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::info;

use crate::core::domain::ReceivedFile;
use crate::core::error::SinkError;
use crate::core::traits::FileSink;

/// Keeps received files in memory
#[derive(Default)]
pub struct MemoryFileSink {
    files: Mutex<Vec<ReceivedFile>>,
}

impl MemoryFileSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> Vec<ReceivedFile> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl FileSink for MemoryFileSink {
    fn save(&self, file: &ReceivedFile) -> Result<(), SinkError> {
        self.files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(file.clone());
        Ok(())
    }
}

/// Writes received files into a download directory
pub struct DirectoryFileSink {
    dir: PathBuf,
}

impl DirectoryFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Target path for `name`, keeping only its final component
    pub fn path_for(&self, name: &str) -> Result<PathBuf, SinkError> {
        let file_name = Path::new(name)
            .file_name()
            .and_then(|n| n.to_str())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .ok_or_else(|| SinkError::Rejected(format!("unusable file name {:?}", name)))?;
        Ok(self.dir.join(file_name))
    }
}

impl FileSink for DirectoryFileSink {
    fn save(&self, file: &ReceivedFile) -> Result<(), SinkError> {
        let path = self.path_for(&file.name)?;
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(&path, &file.data)?;
        info!(path = %path.display(), bytes = file.data.len(), "Saved received file");
        Ok(())
    }
}
