use async_trait::async_trait;
use chrono::Utc;
use dropwatch_common::frame::Frame;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::source::{DimensionGuard, FrameSource, SourceError};

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Replays still images from a directory in file-name order.
pub struct DirectorySource {
    files: Vec<PathBuf>,
    next_index: usize,
    loop_playback: bool,
    guard: DimensionGuard,
    seq: u64,
}

impl DirectorySource {
    pub async fn open(dir: &Path, loop_playback: bool) -> Result<Self, SourceError> {
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| SourceError::Fatal(format!("cannot read {}: {e}", dir.display())))?;

        let mut files = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| SourceError::Fatal(e.to_string()))?
        {
            let path = entry.path();
            let is_image = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| {
                    IMAGE_EXTENSIONS
                        .iter()
                        .any(|known| ext.eq_ignore_ascii_case(known))
                });
            if is_image {
                files.push(path);
            }
        }

        if files.is_empty() {
            return Err(SourceError::Fatal(format!(
                "no images found in {}",
                dir.display()
            )));
        }
        files.sort();
        info!(dir = %dir.display(), images = files.len(), loop_playback, "opened image directory");

        Ok(Self {
            files,
            next_index: 0,
            loop_playback,
            guard: DimensionGuard::default(),
            seq: 0,
        })
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[async_trait]
impl FrameSource for DirectorySource {
    async fn next_frame(&mut self) -> Result<Frame, SourceError> {
        if self.next_index >= self.files.len() {
            if !self.loop_playback {
                return Err(SourceError::Closed);
            }
            debug!("end of directory, looping");
            self.next_index = 0;
        }

        let path = &self.files[self.next_index];
        self.next_index += 1;

        let data = tokio::fs::read(path).await.map_err(|e| {
            warn!(error = %e, path = %path.display(), "failed to read image");
            SourceError::Unavailable(e.to_string())
        })?;

        let seq = self.seq;
        self.seq += 1;
        let frame = Frame::from_jpeg(&data, Utc::now().timestamp_millis(), seq).map_err(|e| {
            warn!(error = %e, path = %path.display(), "failed to decode image");
            SourceError::Unavailable(e.to_string())
        })?;
        self.guard.check(&frame)?;
        Ok(frame)
    }

    fn name(&self) -> &str {
        "directory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dropwatch_common::frame::encode_jpeg;
    use image::{Rgb, RgbImage};

    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!("dropwatch-camera-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn write_jpeg(&self, name: &str, w: u32, h: u32, shade: u8) {
            let img = RgbImage::from_pixel(w, h, Rgb([shade, shade, shade]));
            std::fs::write(self.0.join(name), encode_jpeg(&img, 90).unwrap()).unwrap();
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    #[tokio::test]
    async fn replays_in_name_order_then_closes() {
        let dir = ScratchDir::new();
        dir.write_jpeg("b.jpg", 16, 16, 200);
        dir.write_jpeg("a.jpg", 16, 16, 10);
        std::fs::write(dir.0.join("notes.txt"), b"ignored").unwrap();

        let mut source = DirectorySource::open(&dir.0, false).await.unwrap();
        assert_eq!(source.len(), 2);
        assert!(!source.is_empty());

        let first = source.next_frame().await.unwrap();
        let second = source.next_frame().await.unwrap();
        assert_eq!(first.seq, 0);
        assert_eq!(second.seq, 1);
        assert!(first.image.get_pixel(8, 8).0[0] < 50, "a.jpg should come first");
        assert!(second.image.get_pixel(8, 8).0[0] > 150);
        assert!(matches!(source.next_frame().await, Err(SourceError::Closed)));
    }

    #[tokio::test]
    async fn loops_when_requested() {
        let dir = ScratchDir::new();
        dir.write_jpeg("only.jpg", 8, 8, 0);
        let mut source = DirectorySource::open(&dir.0, true).await.unwrap();
        for expected_seq in 0..3 {
            assert_eq!(source.next_frame().await.unwrap().seq, expected_seq);
        }
    }

    #[tokio::test]
    async fn mismatched_dimensions_are_transient() {
        let dir = ScratchDir::new();
        dir.write_jpeg("0.jpg", 16, 16, 0);
        dir.write_jpeg("1.jpg", 32, 16, 0);
        dir.write_jpeg("2.jpg", 16, 16, 0);
        let mut source = DirectorySource::open(&dir.0, false).await.unwrap();
        assert!(source.next_frame().await.is_ok());
        assert!(source.next_frame().await.unwrap_err().is_transient());
        assert!(source.next_frame().await.is_ok());
    }

    #[tokio::test]
    async fn open_fails_without_images() {
        let dir = ScratchDir::new();
        let err = DirectorySource::open(&dir.0, false).await.err().unwrap();
        assert!(!err.is_transient());

        let missing = dir.0.join("missing");
        assert!(DirectorySource::open(&missing, false).await.is_err());
    }
}
