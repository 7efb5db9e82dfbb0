use bytes::Bytes;

/// JPEG start-of-image marker.
pub const JPEG_SOI: [u8; 2] = [0xFF, 0xD8];
/// JPEG end-of-image marker.
pub const JPEG_EOI: [u8; 2] = [0xFF, 0xD9];

/// One complete JPEG image cut from the capture stream.
///
/// Frames are immutable once published. The payload is a shared `Bytes`
/// buffer, so cloning a frame to hand it to another consumer only bumps a
/// reference count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    data: Bytes,
    /// Sequence number the frame was published under. The first frame is 1.
    pub seq: u64,
    /// Wall-clock time the frame was cut from the stream (Unix millis).
    pub captured_at_ms: i64,
}

impl Frame {
    pub fn new(data: Bytes, seq: u64, captured_at_ms: i64) -> Self {
        Self {
            data,
            seq,
            captured_at_ms,
        }
    }

    /// Create a frame stamped with the current time.
    pub fn now(data: Bytes, seq: u64) -> Self {
        Self::new(data, seq, chrono::Utc::now().timestamp_millis())
    }

    /// Raw JPEG bytes, SOI through EOI inclusive.
    pub fn jpeg_data(&self) -> &[u8] {
        &self.data
    }

    /// Shared handle to the payload.
    pub fn bytes(&self) -> Bytes {
        self.data.clone()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_shares_payload() {
        let frame = Frame::new(Bytes::from_static(&[0xFF, 0xD8, 0x01, 0xFF, 0xD9]), 3, 1708300000000);
        let copy = frame.clone();
        assert_eq!(copy.jpeg_data().as_ptr(), frame.jpeg_data().as_ptr());
        assert_eq!(copy.seq, 3);
    }

    #[test]
    fn now_stamps_wall_clock_millis() {
        let before = chrono::Utc::now().timestamp_millis();
        let frame = Frame::now(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]), 1);
        let after = chrono::Utc::now().timestamp_millis();

        assert!((before..=after).contains(&frame.captured_at_ms));
        assert_eq!(frame.len(), 4);
        assert_eq!(frame.bytes(), Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]));
    }
}
