use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::watch;

use crate::frame::RawFrame;

/// Most recent frame in a slot, tagged with its sequence number.
/// Sequence numbers start at 1 and only grow.
#[derive(Clone, Debug)]
pub struct Published {
    pub seq: u64,
    pub frame: RawFrame,
}

/// Single-slot, latest-wins frame exchange between one producer and any
/// number of consumers.
///
/// `publish` atomically replaces the previous frame; it never queues and
/// never waits on readers. `read` returns the current frame without
/// blocking. Consumers that want to sleep between frames subscribe with
/// [`LatestFrameSlot::watch`] and are woken by the next publish.
pub struct LatestFrameSlot {
    tx: watch::Sender<Option<Published>>,
    seq: AtomicU64,
}

impl LatestFrameSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            tx,
            seq: AtomicU64::new(0),
        }
    }

    /// Replaces the slot content. Callable from a blocking thread.
    pub fn publish(&self, frame: RawFrame) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.tx.send_replace(Some(Published { seq, frame }));
    }

    /// Most recently published frame, or `None` before the first publish.
    pub fn read(&self) -> Option<Published> {
        self.tx.borrow().clone()
    }

    /// Sequence number of the latest publish, 0 before the first.
    pub fn sequence(&self) -> u64 {
        self.seq.load(Ordering::Relaxed)
    }

    pub fn watch(&self) -> FrameWatcher {
        FrameWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

impl Default for LatestFrameSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-consumer view of a slot. Each watcher progresses at its own pace;
/// a stalled watcher holds back nobody.
pub struct FrameWatcher {
    rx: watch::Receiver<Option<Published>>,
}

impl FrameWatcher {
    pub fn latest(&self) -> Option<Published> {
        self.rx.borrow().clone()
    }

    /// Waits until the slot holds a frame newer than `after` (any frame when
    /// `after` is `None`). Returns `None` once the slot itself is gone.
    pub async fn next_newer(&mut self, after: Option<u64>) -> Option<Published> {
        let min = after.map_or(1, |seq| seq + 1);
        match self
            .rx
            .wait_for(|value| value.as_ref().is_some_and(|p| p.seq >= min))
            .await
        {
            Ok(value) => value.clone(),
            Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn solid(shade: u8) -> RawFrame {
        RawFrame::from_packed(4, 2, vec![shade; 4 * 2 * 3]).unwrap()
    }

    #[test]
    fn empty_slot_reads_none() {
        let slot = LatestFrameSlot::new();
        assert!(slot.read().is_none());
        assert_eq!(slot.sequence(), 0);
    }

    #[test]
    fn publish_replaces_and_increments_sequence() {
        let slot = LatestFrameSlot::new();
        slot.publish(solid(1));
        slot.publish(solid(2));

        let published = slot.read().unwrap();
        assert_eq!(published.seq, 2);
        assert_eq!(published.frame.data()[0], 2);
        assert_eq!(slot.sequence(), 2);
    }

    #[tokio::test]
    async fn watcher_wakes_on_publish() {
        let slot = Arc::new(LatestFrameSlot::new());
        let mut watcher = slot.watch();
        assert!(watcher.latest().is_none());

        let slot_c = slot.clone();
        let waiter = tokio::spawn(async move { watcher.next_newer(None).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        slot_c.publish(solid(9));

        let published = waiter.await.unwrap().unwrap();
        assert_eq!(published.seq, 1);
        assert_eq!(published.frame.data()[0], 9);
    }

    #[tokio::test]
    async fn watcher_skips_to_newest() {
        let slot = LatestFrameSlot::new();
        slot.publish(solid(1));
        slot.publish(solid(2));
        slot.publish(solid(3));

        let mut watcher = slot.watch();
        let published = watcher.next_newer(None).await.unwrap();
        assert_eq!(published.seq, 3);

        // Nothing newer than 3 yet; a bounded wait must time out rather
        // than hand back the same frame again.
        let pending =
            tokio::time::timeout(Duration::from_millis(30), watcher.next_newer(Some(3))).await;
        assert!(pending.is_err());
    }

    #[tokio::test]
    async fn stalled_watcher_does_not_hold_back_others() {
        let slot = Arc::new(LatestFrameSlot::new());
        let _stalled = slot.watch();

        let mut active = slot.watch();
        for round in 1..=5u64 {
            slot.publish(solid(round as u8));
            let published = active.next_newer(Some(round - 1)).await.unwrap();
            assert_eq!(published.seq, round);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_reads_never_observe_a_torn_frame() {
        let slot = Arc::new(LatestFrameSlot::new());

        let mut readers = Vec::new();
        for _ in 0..4 {
            let slot = slot.clone();
            readers.push(tokio::spawn(async move {
                let mut last_seq = 0;
                while last_seq < 200 {
                    if let Some(published) = slot.read() {
                        let first = published.frame.data()[0];
                        assert!(published.frame.data().iter().all(|byte| *byte == first));
                        assert!(published.seq >= last_seq);
                        last_seq = published.seq;
                    }
                    tokio::task::yield_now().await;
                }
            }));
        }

        let writer = tokio::task::spawn_blocking({
            let slot = slot.clone();
            move || {
                for shade in 0..200u64 {
                    slot.publish(solid((shade % 251) as u8));
                }
                slot.publish(solid(255));
            }
        });

        writer.await.unwrap();
        for reader in readers {
            reader.await.unwrap();
        }
    }
}
