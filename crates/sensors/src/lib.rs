pub mod chip;
pub mod frame;
pub mod replay;
pub mod source;
pub mod synthetic;
pub mod units;

// Re-export the main types that users need
pub use frame::{FrameCodec, FrameError, FrameLayout, FrameSamples};
pub use replay::FileReplaySource;
pub use source::{RawBlockSource, SourceError, SourceStatus};
pub use synthetic::{SignalGenerator, SyntheticConfig, SyntheticSource};
