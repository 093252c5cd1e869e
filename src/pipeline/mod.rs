pub mod command;
pub mod control;
pub mod queue;
pub mod runner;

pub use command::{Command, CommandController};
pub use control::{ControlState, RecordingMode};
pub use queue::{BoundedQueue, FrameQueue};
pub use runner::CapturePipeline;
