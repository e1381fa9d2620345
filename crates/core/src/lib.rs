//! Streaming building blocks for voice and text conversational agents: the
//! frame pipeline, its stages, the remote reasoning bridge and the
//! collaborator traits they drive.

pub mod aggregator;
pub mod audio;
pub mod bridge;
pub mod conversation;
pub mod frames;
pub mod llm_client;
pub mod pipeline;
pub mod protocol;
pub mod speech;
pub mod stage;
pub mod stages;

pub use pipeline::{FramePipeline, TransportEvent};
pub use stage::{FrameError, FrameReceiver, FrameSender};
