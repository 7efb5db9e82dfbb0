use bytes::{Bytes, BytesMut};
use frame_cast_common::frame::{JPEG_EOI, JPEG_SOI};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::buffer::FrameBuffer;
use crate::error::CaptureError;

/// Cuts complete JPEG images out of a raw MJPEG byte stream.
///
/// The capture tool writes JPEGs back to back with no length prefix, so
/// frames are delimited by the in-band SOI/EOI markers. Bytes that precede
/// an SOI are junk from a partial frame and get dropped.
pub struct FrameExtractor {
    buf: BytesMut,
    max_pending: usize,
    /// Offset at which the next EOI scan resumes. Only meaningful while
    /// `buf` starts with an SOI.
    scan_from: usize,
    recoveries: u64,
}

impl FrameExtractor {
    pub fn new(max_pending: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(256 * 1024),
            max_pending,
            scan_from: 0,
            recoveries: 0,
        }
    }

    pub fn feed(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Pull the next complete frame out of the accumulator, if there is one.
    /// Call repeatedly after each `feed` until it returns `None`.
    pub fn next_frame(&mut self) -> Option<Bytes> {
        let soi = match find_subsequence(&self.buf, &JPEG_SOI) {
            Some(pos) => pos,
            None => {
                if self.buf.len() > self.max_pending {
                    self.recover();
                }
                return None;
            }
        };

        if soi > 0 {
            let _ = self.buf.split_to(soi);
            self.scan_from = 0;
        }

        let from = self.scan_from.max(JPEG_SOI.len());
        match find_subsequence(&self.buf[from..], &JPEG_EOI) {
            Some(pos) => {
                let end = from + pos + JPEG_EOI.len();
                let frame = Bytes::copy_from_slice(&self.buf[..end]);
                let _ = self.buf.split_to(end);
                self.scan_from = 0;
                Some(frame)
            }
            None => {
                if self.buf.len() > self.max_pending {
                    self.recover();
                } else {
                    // Back off one byte in case the EOI straddles two reads.
                    self.scan_from = self.buf.len().saturating_sub(1).max(JPEG_SOI.len());
                }
                None
            }
        }
    }

    /// Number of times the accumulator was thrown away to resynchronise.
    pub fn recoveries(&self) -> u64 {
        self.recoveries
    }

    fn recover(&mut self) {
        let discarded = self.buf.len();
        self.buf.clear();
        self.scan_from = 0;
        self.recoveries += 1;
        warn!(
            error = %CaptureError::CorruptStreamRecovered { discarded },
            limit = self.max_pending,
            "capture stream lost sync, accumulator cleared"
        );
    }
}

/// Counters reported when an extractor task finishes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractorStats {
    pub frames: u64,
    pub bytes: u64,
    pub recoveries: u64,
}

/// Producer loop: read the capture stream, publish every complete frame.
///
/// Runs until the stream hits EOF, a read fails, or `shutdown` fires.
/// Exactly one of these runs per capture session, so the accumulator needs
/// no locking; only the publish touches shared state.
pub async fn run_extractor<R>(
    mut reader: R,
    buffer: &FrameBuffer,
    max_pending: usize,
    read_chunk: usize,
    mut shutdown: watch::Receiver<bool>,
) -> ExtractorStats
where
    R: AsyncRead + Unpin,
{
    let mut extractor = FrameExtractor::new(max_pending);
    let mut read_buf = vec![0u8; read_chunk.max(1)];
    let mut stats = ExtractorStats::default();

    loop {
        let n = tokio::select! {
            res = reader.read(&mut read_buf) => match res {
                Ok(0) => {
                    info!(frames = stats.frames, "capture stream closed");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "capture stream read failed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                debug!("extractor shutdown requested");
                break;
            }
        };

        stats.bytes += n as u64;
        extractor.feed(&read_buf[..n]);

        while let Some(jpeg) = extractor.next_frame() {
            let bytes = jpeg.len();
            let seq = buffer.publish(jpeg);
            stats.frames += 1;
            if seq % 100 == 0 {
                debug!(seq, bytes, "frames published");
            }
        }
    }

    stats.recoveries = extractor.recoveries();
    stats
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMIT: usize = 2_000_000;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut v = JPEG_SOI.to_vec();
        v.extend_from_slice(body);
        v.extend_from_slice(&JPEG_EOI);
        v
    }

    fn drain(extractor: &mut FrameExtractor) -> Vec<Bytes> {
        std::iter::from_fn(|| extractor.next_frame()).collect()
    }

    #[test]
    fn garbage_between_frames_is_dropped() {
        let f1 = jpeg(b"first");
        let f2 = jpeg(b"second");
        let mut stream = b"AAAA".to_vec();
        stream.extend_from_slice(&f1);
        stream.extend_from_slice(b"BB");
        stream.extend_from_slice(&f2);

        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.feed(&stream);
        let frames = drain(&mut extractor);

        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &f1[..]);
        assert_eq!(&frames[1][..], &f2[..]);
        assert!(extractor.next_frame().is_none());
    }

    #[test]
    fn unterminated_frame_waits_for_more_bytes() {
        let frame = jpeg(b"partial-then-complete");
        let (head, tail) = frame.split_at(10);

        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.feed(head);
        assert!(extractor.next_frame().is_none());

        extractor.feed(tail);
        assert_eq!(&extractor.next_frame().unwrap()[..], &frame[..]);
        assert!(extractor.next_frame().is_none());
    }

    #[test]
    fn end_marker_split_across_reads() {
        let frame = jpeg(b"xyz");
        let split = frame.len() - 1;

        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.feed(&frame[..split]);
        assert!(extractor.next_frame().is_none());
        extractor.feed(&frame[split..]);
        assert_eq!(&extractor.next_frame().unwrap()[..], &frame[..]);
    }

    #[test]
    fn byte_at_a_time_feed() {
        let a = jpeg(b"one");
        let b = jpeg(b"two");
        let stream: Vec<u8> = [b"\x00\x01".as_slice(), &a, b"\xFF", &b].concat();

        let mut extractor = FrameExtractor::new(LIMIT);
        let mut frames = Vec::new();
        for byte in stream {
            extractor.feed(&[byte]);
            frames.extend(drain(&mut extractor));
        }
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &a[..]);
        assert_eq!(&frames[1][..], &b[..]);
    }

    #[test]
    fn start_marker_bytes_are_not_an_end_marker() {
        // FF D8 D9 must not be read as SOI followed by an overlapping EOI.
        let mut extractor = FrameExtractor::new(LIMIT);
        extractor.feed(&[0xFF, 0xD8, 0xD9, 0x00]);
        assert!(extractor.next_frame().is_none());
        extractor.feed(&[0xFF, 0xD9]);
        assert_eq!(
            &extractor.next_frame().unwrap()[..],
            &[0xFF, 0xD8, 0xD9, 0x00, 0xFF, 0xD9]
        );
    }

    #[test]
    fn oversized_garbage_is_discarded_and_extraction_continues() {
        let mut extractor = FrameExtractor::new(LIMIT);
        let noise = vec![0x55u8; 512 * 1024];
        for _ in 0..4 {
            extractor.feed(&noise);
            assert!(extractor.next_frame().is_none());
        }
        assert_eq!(extractor.recoveries(), 1);

        let frame = jpeg(b"after the storm");
        extractor.feed(&frame);
        assert_eq!(&extractor.next_frame().unwrap()[..], &frame[..]);
    }

    #[test]
    fn runaway_unterminated_frame_is_discarded() {
        let mut extractor = FrameExtractor::new(1024);
        extractor.feed(&JPEG_SOI);
        extractor.feed(&vec![0x11u8; 2048]);
        assert!(extractor.next_frame().is_none());
        assert_eq!(extractor.recoveries(), 1);

        // Nothing of the dropped frame leaks into the next one.
        let frame = jpeg(b"fresh");
        extractor.feed(&frame);
        assert_eq!(&extractor.next_frame().unwrap()[..], &frame[..]);
        assert!(extractor.next_frame().is_none());
    }

    #[tokio::test]
    async fn run_extractor_publishes_in_order_until_eof() {
        let frames: Vec<Vec<u8>> = (0..5u8).map(|i| jpeg(&[i; 100])).collect();
        let mut stream = Vec::new();
        for f in &frames {
            stream.extend_from_slice(b"junk");
            stream.extend_from_slice(f);
        }

        let buffer = FrameBuffer::new();
        let (_tx, rx) = watch::channel(false);
        let stats = run_extractor(stream.as_slice(), &buffer, LIMIT, 7, rx).await;

        assert_eq!(stats.frames, 5);
        assert_eq!(stats.bytes, stream.len() as u64);
        assert_eq!(stats.recoveries, 0);
        assert_eq!(buffer.sequence(), 5);
        assert_eq!(buffer.latest().unwrap().jpeg_data(), &frames[4][..]);
    }

    #[tokio::test]
    async fn run_extractor_stops_on_shutdown() {
        let (_writer, reader) = tokio::io::duplex(64);
        let buffer = FrameBuffer::new();
        let (tx, rx) = watch::channel(false);

        let stop = async {
            tokio::task::yield_now().await;
            tx.send(true).unwrap();
        };
        let (stats, ()) = tokio::join!(run_extractor(reader, &buffer, LIMIT, 64, rx), stop);

        assert_eq!(stats, ExtractorStats::default());
        assert_eq!(buffer.sequence(), 0);
    }
}
