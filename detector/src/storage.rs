use async_trait::async_trait;
use dropwatch_common::config::SnapshotConfig;
use dropwatch_common::frame::encode_jpeg;
use image::RgbImage;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::trigger::keys::{is_snapshot_name, snapshot_file_name};

const TMP_SUFFIX: &str = ".tmp";

/// Destination for trigger snapshots.
#[async_trait]
pub trait TriggerSink: Send + Sync {
    /// Persist `image` taken at `ts` (Unix seconds) and return a reference to
    /// it. Once this returns `Ok` the artifact is durable.
    async fn save(&self, image: &RgbImage, ts: f64) -> Result<String, StorageError>;
}

/// Filesystem-backed snapshot store.
///
/// Files are written to a hidden temp name, fsynced and renamed into place,
/// so a listed snapshot is always complete.
pub struct SnapshotStore {
    dir: PathBuf,
    quality: u8,
    max_files: usize,
}

impl SnapshotStore {
    /// Create the directory if needed and clear temp files left behind by an
    /// interrupted run.
    pub async fn open(config: &SnapshotConfig) -> Result<Self, StorageError> {
        let dir = PathBuf::from(&config.dir);
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = tokio::fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with('.') && name.ends_with(TMP_SUFFIX) {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => info!(file = name, "removed stale snapshot temp file"),
                    Err(e) => warn!(error = %e, file = name, "failed to remove stale temp file"),
                }
            }
        }

        info!(dir = %dir.display(), quality = config.jpeg_quality, max_files = config.max_files, "snapshot store ready");
        Ok(Self {
            dir,
            quality: config.jpeg_quality,
            max_files: config.max_files,
        })
    }

    /// Snapshot file names, most recent first.
    pub async fn list(&self) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if is_snapshot_name(name) {
                    names.push(name.to_string());
                }
            }
        }
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names)
    }

    /// Raw bytes of a stored snapshot, or `None` if it does not exist.
    pub async fn read(&self, name: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if !is_snapshot_name(name) {
            return Err(StorageError::InvalidName(name.to_string()));
        }
        match tokio::fs::read(self.dir.join(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_atomic(&self, name: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let final_path = self.dir.join(name);
        let tmp_path = self.dir.join(format!(".{name}{TMP_SUFFIX}"));

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&tmp_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e.into());
        }
        Ok(final_path)
    }

    /// Delete the oldest snapshots beyond `max_files`.
    async fn enforce_retention(&self) {
        if self.max_files == 0 {
            return;
        }
        let names = match self.list().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "failed to list snapshots for retention");
                return;
            }
        };
        for name in names.iter().skip(self.max_files) {
            match tokio::fs::remove_file(self.dir.join(name)).await {
                Ok(()) => debug!(file = name, "evicted old snapshot"),
                Err(e) => warn!(error = %e, file = name, "failed to evict snapshot"),
            }
        }
    }
}

#[async_trait]
impl TriggerSink for SnapshotStore {
    async fn save(&self, image: &RgbImage, ts: f64) -> Result<String, StorageError> {
        let jpeg = encode_jpeg(image, self.quality)
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        let name = snapshot_file_name(ts);

        let path = self.write_atomic(&name, &jpeg).await?;
        debug!(path = %path.display(), bytes = jpeg.len(), "snapshot written");

        self.enforce_retention().await;
        Ok(path.display().to_string())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("snapshot I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(String),
    #[error("invalid snapshot name: {0}")]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new() -> Self {
            Self(std::env::temp_dir().join(format!("dropwatch-store-{}", uuid::Uuid::new_v4())))
        }

        fn config(&self, max_files: usize) -> SnapshotConfig {
            SnapshotConfig {
                dir: self.0.display().to_string(),
                jpeg_quality: 90,
                max_files,
            }
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn crop() -> RgbImage {
        RgbImage::from_pixel(70, 70, Rgb([200, 10, 10]))
    }

    #[tokio::test]
    async fn save_writes_complete_jpeg() {
        let scratch = ScratchDir::new();
        let store = SnapshotStore::open(&scratch.config(0)).await.unwrap();

        let reference = store.save(&crop(), 1771407000.0).await.unwrap();
        assert!(reference.ends_with("snap_20260218T093000000Z.jpg"));

        let data = std::fs::read(&reference).unwrap();
        assert_eq!(&data[..2], &[0xFF, 0xD8]);
        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (70, 70));
    }

    #[tokio::test]
    async fn list_is_most_recent_first_and_skips_temp_files() {
        let scratch = ScratchDir::new();
        let store = SnapshotStore::open(&scratch.config(0)).await.unwrap();
        store.save(&crop(), 1771407000.0).await.unwrap();
        store.save(&crop(), 1771407010.0).await.unwrap();
        std::fs::write(scratch.0.join(".snap_partial.jpg.tmp"), b"xx").unwrap();

        let names = store.list().await.unwrap();
        assert_eq!(
            names,
            vec![
                "snap_20260218T093010000Z.jpg".to_string(),
                "snap_20260218T093000000Z.jpg".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn open_removes_stale_temp_files() {
        let scratch = ScratchDir::new();
        std::fs::create_dir_all(&scratch.0).unwrap();
        let stale = scratch.0.join(".snap_20260218T093000000Z.jpg.tmp");
        std::fs::write(&stale, b"partial").unwrap();

        SnapshotStore::open(&scratch.config(0)).await.unwrap();
        assert!(!stale.exists());
    }

    #[tokio::test]
    async fn retention_keeps_newest() {
        let scratch = ScratchDir::new();
        let store = SnapshotStore::open(&scratch.config(2)).await.unwrap();
        for i in 0..4 {
            store.save(&crop(), 1771407000.0 + i as f64 * 10.0).await.unwrap();
        }
        let names = store.list().await.unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], "snap_20260218T093030000Z.jpg");
        assert_eq!(names[1], "snap_20260218T093020000Z.jpg");
    }

    #[tokio::test]
    async fn read_validates_names() {
        let scratch = ScratchDir::new();
        let store = SnapshotStore::open(&scratch.config(0)).await.unwrap();
        store.save(&crop(), 1771407000.0).await.unwrap();

        assert!(store
            .read("snap_20260218T093000000Z.jpg")
            .await
            .unwrap()
            .is_some());
        assert!(store
            .read("snap_20990101T000000000Z.jpg")
            .await
            .unwrap()
            .is_none());
        assert!(matches!(
            store.read("../secret.jpg").await,
            Err(StorageError::InvalidName(_))
        ));
    }
}
