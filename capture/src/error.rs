use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    /// The capture process could not be spawned or is not producing output.
    /// Recoverable: the next consumer arrival retries the start.
    #[error("capture unavailable: {0}")]
    Unavailable(String),
    /// No frame arrived within the caller's bound.
    #[error("no frame within {0:?}")]
    FrameTimeout(Duration),
    /// The extractor threw away its accumulator to resynchronise.
    #[error("discarded {discarded} bytes of unframed capture data")]
    CorruptStreamRecovered { discarded: usize },
}
