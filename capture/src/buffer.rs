use std::time::Duration;

use bytes::Bytes;
use frame_cast_common::frame::Frame;
use tokio::sync::watch;

/// Latest-frame slot shared between the extractor and every consumer.
///
/// Backed by a `watch` channel: it keeps only the newest value, `publish`
/// never waits for readers, and every waiting consumer is woken on each
/// publish. The sequence number lives in the frame itself, so
/// `sequence() == 0` exactly when nothing has been published yet.
#[derive(Debug)]
pub struct FrameBuffer {
    tx: watch::Sender<Option<Frame>>,
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameBuffer {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Replace the latest frame and wake all waiters. Returns the new sequence.
    pub fn publish(&self, data: Bytes) -> u64 {
        let mut seq = 0;
        self.tx.send_modify(|slot| {
            seq = slot.as_ref().map_or(0, |f| f.seq) + 1;
            *slot = Some(Frame::now(data, seq));
        });
        seq
    }

    /// Wait for a frame whose sequence differs from `last_seen`.
    ///
    /// Returns immediately if one is already there. Otherwise waits for the
    /// next publish or for `timeout`, whichever comes first, and returns
    /// whatever is latest at that point. `None` means nothing has ever been
    /// published.
    pub async fn wait_for_newer(&self, last_seen: u64, timeout: Duration) -> Option<Frame> {
        let mut rx = self.tx.subscribe();
        let fresh = newer_than(&rx.borrow_and_update(), last_seen);
        if fresh.is_some() {
            return fresh;
        }

        // changed() only fails once the sender is dropped, and we own it.
        let _ = tokio::time::timeout(timeout, rx.changed()).await;
        let latest = rx.borrow().clone();
        latest
    }

    pub fn latest(&self) -> Option<Frame> {
        self.tx.borrow().clone()
    }

    pub fn sequence(&self) -> u64 {
        self.tx.borrow().as_ref().map_or(0, |f| f.seq)
    }
}

fn newer_than(slot: &Option<Frame>, last_seen: u64) -> Option<Frame> {
    slot.as_ref().filter(|f| f.seq != last_seen).cloned()
}
