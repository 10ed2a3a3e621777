pub mod directory;
pub mod mjpeg;
pub mod source;

use dropwatch_common::config::{SourceConfig, SourceKind};
use std::path::Path;
use std::time::Duration;

pub use directory::DirectorySource;
pub use mjpeg::{MjpegParser, MjpegSource};
pub use source::{FrameSource, SourceError};

/// Open the configured frame source. Any error here is permanent.
pub async fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>, SourceError> {
    match config.kind {
        SourceKind::Mjpeg => {
            let timeout = Duration::from_secs(config.connect_timeout_secs);
            Ok(Box::new(MjpegSource::open(&config.url, timeout).await?))
        }
        SourceKind::Directory => Ok(Box::new(
            DirectorySource::open(Path::new(&config.path), config.loop_playback).await?,
        )),
    }
}
