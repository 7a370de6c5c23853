//! Commit-timer management.
//!
//! The engine arms one 2Δ timer per voted block and cancels them in
//! height ranges when blocks commit or a view change voids them. Keying
//! the table by height makes the range cancel a cheap map split instead
//! of a scan.

use kestrel_core::Event;
use kestrel_types::{Hash, Height};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Height-keyed commit timers.
///
/// Each timer is a tokio task that sleeps for 2Δ and then sends
/// `Event::CommitTimeout` on the engine's queue; cancellation aborts the
/// task before it fires.
pub struct CommitTimers {
    timers: BTreeMap<Height, Vec<(Hash, JoinHandle<()>)>>,
    event_tx: mpsc::Sender<Event>,
}

impl CommitTimers {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            timers: BTreeMap::new(),
            event_tx,
        }
    }

    /// Arm the commit timer for a block.
    pub fn set(&mut self, blk_hash: Hash, height: Height, duration: Duration) {
        let event_tx = self.event_tx.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            trace!(block = %blk_hash.short(), "commit timer fired");
            let _ = event_tx.send(Event::CommitTimeout { blk_hash }).await;
        });
        self.timers.entry(height).or_default().push((blk_hash, handle));
        debug!(block = %blk_hash.short(), height, ?duration, "commit timer set");
    }

    /// Cancel every armed timer at or below `height`.
    pub fn stop_up_to(&mut self, height: Height) {
        let keep = match height.checked_add(1) {
            Some(next) => self.timers.split_off(&next),
            None => BTreeMap::new(),
        };
        let cancelled = std::mem::replace(&mut self.timers, keep);
        for (h, entries) in cancelled {
            for (blk_hash, handle) in entries {
                handle.abort();
                trace!(block = %blk_hash.short(), height = h, "commit timer cancelled");
            }
        }
    }

    /// Number of armed timers.
    pub fn active_count(&self) -> usize {
        self.timers.values().map(Vec::len).sum()
    }
}

impl Drop for CommitTimers {
    fn drop(&mut self) {
        self.stop_up_to(Height::MAX);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timer_fires_with_block_hash() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut timers = CommitTimers::new(event_tx);

        let hash = Hash::digest(b"b1");
        timers.set(hash, 1, Duration::from_millis(10));

        let event = tokio::time::timeout(Duration::from_millis(200), event_rx.recv())
            .await
            .expect("timer fires")
            .expect("channel open");
        assert!(matches!(event, Event::CommitTimeout { blk_hash } if blk_hash == hash));
    }

    #[tokio::test]
    async fn test_stop_up_to_is_a_range_cancel() {
        let (event_tx, mut event_rx) = mpsc::channel(8);
        let mut timers = CommitTimers::new(event_tx);

        for h in 1..=4u32 {
            timers.set(Hash::digest(&[h as u8]), h, Duration::from_millis(30));
        }
        assert_eq!(timers.active_count(), 4);

        timers.stop_up_to(2);
        assert_eq!(timers.active_count(), 2);

        // Only the timers above the cancelled range fire.
        let mut fired = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(200), event_rx.recv()).await
        {
            if let Event::CommitTimeout { blk_hash } = event {
                fired.push(blk_hash);
            }
            if fired.len() == 2 {
                break;
            }
        }
        assert_eq!(fired.len(), 2);
        assert!(fired.contains(&Hash::digest(&[3])));
        assert!(fired.contains(&Hash::digest(&[4])));
    }

    #[tokio::test]
    async fn test_multiple_timers_per_height() {
        let (event_tx, _event_rx) = mpsc::channel(8);
        let mut timers = CommitTimers::new(event_tx);

        timers.set(Hash::digest(b"a"), 3, Duration::from_secs(10));
        timers.set(Hash::digest(b"b"), 3, Duration::from_secs(10));
        assert_eq!(timers.active_count(), 2);

        timers.stop_up_to(3);
        assert_eq!(timers.active_count(), 0);
    }
}
