pub mod annotate;
pub mod hub;
pub mod motion;
pub mod pipeline;
pub mod storage;
pub mod trigger;

pub use annotate::annotate;
pub use hub::{BroadcastHub, ChannelClient, ClientId, ClientMailbox, ClientSink, Outbound, SendError};
pub use pipeline::{FrameRateLimiter, PipelineDriver, PipelineSettings, PipelineSummary};
pub use storage::{SnapshotStore, StorageError, TriggerSink};
