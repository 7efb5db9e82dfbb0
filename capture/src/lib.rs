//! Capture side of frame-cast: one capture subprocess, one extractor task
//! cutting JPEG frames out of its stdout, and a latest-frame buffer that any
//! number of consumers wait on.

pub mod buffer;
pub mod camera;
pub mod error;
pub mod extractor;
pub mod process;
pub mod session;

pub use buffer::FrameBuffer;
pub use camera::{Camera, CameraStatus};
pub use error::CaptureError;
pub use extractor::FrameExtractor;
pub use process::{CaptureProcess, CaptureSource, ReplaySource, RpicamSource};
pub use session::{Cursor, FrameStream};
