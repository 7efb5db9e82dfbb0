use std::sync::Arc;
use std::time::Duration;

use frame_cast_common::frame::Frame;
use futures_util::stream::{self, BoxStream, StreamExt};

use crate::buffer::FrameBuffer;
use crate::camera::Camera;

/// Per-consumer record of the last sequence handed out.
///
/// Starts at 0, below every real sequence, so the first wait returns as soon
/// as any frame exists.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    last_seen: u64,
}

impl Cursor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for a frame newer than the cursor and advance to it.
    pub async fn next(&mut self, buffer: &FrameBuffer, timeout: Duration) -> Option<Frame> {
        let frame = buffer.wait_for_newer(self.last_seen, timeout).await?;
        self.last_seen = frame.seq;
        Some(frame)
    }
}

pub type FrameStream = BoxStream<'static, Frame>;

/// Endless stream of frames for one continuous viewer.
///
/// Every consumer gets its own cursor, so streams are independent of one
/// another and can be created at any time. When the wait times out and a
/// frame already exists, that frame is yielded again, which keeps slow
/// cameras from looking like dead connections. When nothing has been
/// captured yet the stream keeps waiting and keeps nudging the camera to
/// start. Dropping the stream is the only way to end it.
pub fn frame_stream(camera: Arc<Camera>) -> FrameStream {
    stream::unfold((camera, Cursor::new()), |(camera, mut cursor)| async move {
        loop {
            camera.start_for_consumer();
            let timeout = camera.frame_timeout();
            if let Some(frame) = cursor.next(camera.buffer(), timeout).await {
                return Some((frame, (camera, cursor)));
            }
        }
    })
    .boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test(start_paused = true)]
    async fn cursor_advances_and_then_waits() {
        let buffer = FrameBuffer::new();
        let mut cursor = Cursor::new();

        buffer.publish(Bytes::from_static(b"\xFF\xD8a\xFF\xD9"));
        buffer.publish(Bytes::from_static(b"\xFF\xD8b\xFF\xD9"));

        let frame = cursor.next(&buffer, Duration::from_secs(1)).await.unwrap();
        assert_eq!(frame.seq, 2);

        let start = tokio::time::Instant::now();
        let again = cursor.next(&buffer, Duration::from_secs(1)).await.unwrap();
        assert_eq!(again.seq, 2);
        assert!(start.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_on_empty_buffer_yields_nothing() {
        let buffer = FrameBuffer::new();
        let mut cursor = Cursor::new();
        assert!(cursor.next(&buffer, Duration::from_millis(100)).await.is_none());
        assert_eq!(cursor, Cursor::new());
    }
}
