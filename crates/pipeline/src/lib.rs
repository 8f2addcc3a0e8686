//! Orchestration layer: photo processing, batch ingestion and live
//! scanning over the perception engine, identity store and matcher.

pub mod camera;
pub mod context;
pub mod live_scan;
pub mod processor;

pub use camera::{FfmpegCamera, FrameSource, ScriptedFrame, ScriptedSource};
pub use context::CoreContext;
pub use live_scan::{
    Capture, CaptureOutcome, LiveScanner, ScanFailure, ScanOptions, ScanOutcome,
};
pub use processor::{IngestReceipt, PhotoProcessor, PhotoReport};
