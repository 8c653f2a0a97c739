use std::path::{Path, PathBuf};

use tokio::fs;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{CounterError, Result};

/// Upload and output locations for job files.
pub struct FileStorage {
    upload_dir: PathBuf,
    output_dir: PathBuf,
    allowed_extensions: Vec<String>,
    output_prefix: String,
}

impl FileStorage {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            upload_dir: config.upload_dir.clone(),
            output_dir: config.output_dir.clone(),
            allowed_extensions: config
                .allowed_extensions
                .iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            output_prefix: config.output_prefix.clone(),
        }
    }

    /// Case-insensitive extension check against the configured list.
    pub fn is_allowed(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| self.allowed_extensions.iter().any(|a| a.eq_ignore_ascii_case(ext)))
            .unwrap_or(false)
    }

    /// Strips directory components so uploads cannot escape `upload_dir`.
    pub fn sanitize_filename(original_filename: &str) -> Option<String> {
        let name = Path::new(original_filename).file_name()?.to_str()?.trim();
        if name.is_empty() || name == "." || name == ".." {
            return None;
        }
        Some(name.to_string())
    }

    /// Writes an upload as `{job_id}_{filename}` and returns its path.
    pub async fn save_upload(&self, job_id: Uuid, content: &[u8], original_filename: &str) -> Result<PathBuf> {
        let filename = Self::sanitize_filename(original_filename)
            .ok_or_else(|| CounterError::InvalidInput(format!("invalid file name {:?}", original_filename)))?;
        if !self.is_allowed(Path::new(&filename)) {
            return Err(CounterError::InvalidInput(format!(
                "{} has an unsupported extension (allowed: {})",
                filename,
                self.allowed_extensions.join(", ")
            )));
        }

        fs::create_dir_all(&self.upload_dir).await?;
        let path = self.upload_dir.join(format!("{}_{}", job_id, filename));
        fs::write(&path, content).await?;
        Ok(path)
    }

    /// `output_dir/{prefix}{input file name}`; the output directory is created on demand.
    pub async fn output_path_for(&self, input: &Path) -> Result<PathBuf> {
        let name = input
            .file_name()
            .and_then(|name| name.to_str())
            .ok_or_else(|| CounterError::InvalidInput(format!("{} has no file name", input.display())))?;
        fs::create_dir_all(&self.output_dir).await?;
        Ok(self.output_dir.join(format!("{}{}", self.output_prefix, name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(root: &Path) -> FileStorage {
        FileStorage::new(&StorageConfig {
            upload_dir: root.join("uploads"),
            output_dir: root.join("outputs"),
            ..StorageConfig::default()
        })
    }

    #[test]
    fn test_extension_check_ignores_case() {
        let storage = FileStorage::new(&StorageConfig::default());
        assert!(storage.is_allowed(Path::new("clip.MP4")));
        assert!(storage.is_allowed(Path::new("dir/clip.mkv")));
        assert!(!storage.is_allowed(Path::new("clip.gif")));
        assert!(!storage.is_allowed(Path::new("mp4")));
    }

    #[test]
    fn test_sanitize_filename_drops_directories() {
        assert_eq!(FileStorage::sanitize_filename("../../etc/a.mp4").as_deref(), Some("a.mp4"));
        assert_eq!(FileStorage::sanitize_filename(".."), None);
        assert_eq!(FileStorage::sanitize_filename(""), None);
    }

    #[tokio::test]
    async fn test_save_upload_prefixes_job_id() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let job_id = Uuid::new_v4();

        let path = storage.save_upload(job_id, b"data", "walk.mp4").await.unwrap();
        assert_eq!(path, dir.path().join("uploads").join(format!("{}_walk.mp4", job_id)));
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[tokio::test]
    async fn test_save_upload_rejects_extension() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let err = storage.save_upload(Uuid::new_v4(), b"x", "notes.txt").await.unwrap_err();
        assert!(matches!(err, CounterError::InvalidInput(_)));
        assert!(!dir.path().join("uploads").exists());
    }

    #[tokio::test]
    async fn test_output_path_uses_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = storage(dir.path());
        let output = storage.output_path_for(Path::new("/videos/walk.mp4")).await.unwrap();
        assert_eq!(output, dir.path().join("outputs").join("processed_walk.mp4"));
        assert!(dir.path().join("outputs").is_dir());
    }
}
