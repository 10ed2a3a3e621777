use async_trait::async_trait;
use dropwatch_common::frame::Frame;

/// A producer of camera frames.
///
/// Implementations distinguish transient gaps (`SourceError::Unavailable`),
/// after which the caller should wait briefly and ask again, from permanent
/// failure (`Closed` / `Fatal`), after which no more frames will arrive.
#[async_trait]
pub trait FrameSource: Send {
    async fn next_frame(&mut self) -> Result<Frame, SourceError>;

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("no frame available: {0}")]
    Unavailable(String),
    #[error("frame source exhausted")]
    Closed,
    #[error("frame source failed: {0}")]
    Fatal(String),
}

impl SourceError {
    /// `true` if retrying later may yield a frame.
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Unavailable(_))
    }
}

/// Pins frame dimensions to those of the first accepted frame.
#[derive(Debug, Default)]
pub(crate) struct DimensionGuard {
    expected: Option<(u32, u32)>,
}

impl DimensionGuard {
    pub(crate) fn check(&mut self, frame: &Frame) -> Result<(), SourceError> {
        let dims = frame.dimensions();
        match self.expected {
            None => {
                self.expected = Some(dims);
                Ok(())
            }
            Some(expected) if expected == dims => Ok(()),
            Some((w, h)) => Err(SourceError::Unavailable(format!(
                "frame is {}x{}, expected {w}x{h}",
                dims.0, dims.1
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn only_unavailable_is_transient() {
        assert!(SourceError::Unavailable("gap".into()).is_transient());
        assert!(!SourceError::Closed.is_transient());
        assert!(!SourceError::Fatal("gone".into()).is_transient());
    }

    #[test]
    fn guard_locks_first_dimensions() {
        let mut guard = DimensionGuard::default();
        let first = Frame::new(RgbImage::new(64, 48), 0, 0);
        let same = Frame::new(RgbImage::new(64, 48), 0, 1);
        let other = Frame::new(RgbImage::new(32, 48), 0, 2);
        assert!(guard.check(&first).is_ok());
        assert!(guard.check(&same).is_ok());
        let err = guard.check(&other).unwrap_err();
        assert!(err.is_transient());
    }
}
