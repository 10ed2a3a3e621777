pub mod background;
pub mod blob;
pub mod morphology;

pub use background::BackgroundModel;
pub use blob::BlobDetector;
