//! "N new entries" staging between a refresh and the visible feed.
use futures::future::{BoxFuture, FutureExt};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::buffer::MergeBuffer;
use crate::config::NotificationPolicy;
use crate::lock;
use crate::model::{feed_order, Entry};
use crate::schedule::Scheduler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifierSettings {
    pub policy: NotificationPolicy,
    pub preview_count: usize,
    pub display_timeout: Duration,
}

/// What the banner shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub count: usize,
    /// Thumbnails of the newest staged entries.
    pub preview: Vec<String>,
    /// True when the entries are already in the feed (auto-merge policy).
    pub merged: bool,
}

#[derive(Debug)]
struct Staged {
    id: u64,
    entries: Vec<Entry>,
    notification: Notification,
    expires_at: Instant,
}

pub struct NewEntryNotifier {
    settings: NotifierSettings,
    scheduler: Arc<dyn Scheduler>,
    buffer: Arc<Mutex<MergeBuffer>>,
    slot: Arc<Mutex<Slot>>,
}

#[derive(Debug, Default)]
struct Slot {
    staged: Option<Staged>,
    next_id: u64,
}

impl NewEntryNotifier {
    pub fn new(
        settings: NotifierSettings,
        scheduler: Arc<dyn Scheduler>,
        buffer: Arc<Mutex<MergeBuffer>>,
    ) -> Self {
        Self {
            settings,
            scheduler,
            buffer,
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Stage entries discovered by a refresh, replacing any pending batch.
    ///
    /// Entries already in the feed are ignored; when nothing new remains the
    /// current banner is left alone and `None` is returned.
    pub fn stage(&self, entries: Vec<Entry>) -> Option<Notification> {
        let mut fresh = {
            let buf = lock(&self.buffer);
            let mut seen = HashSet::new();
            let fresh: Vec<Entry> = entries
                .into_iter()
                .filter(|e| !buf.contains(&e.identity) && seen.insert(e.identity.clone()))
                .collect();
            fresh
        };
        if fresh.is_empty() {
            debug!("refresh found nothing new");
            return None;
        }
        fresh.sort_by(feed_order);

        let preview = fresh
            .iter()
            .filter_map(|e| e.display.thumbnail.clone())
            .take(self.settings.preview_count)
            .collect();
        let merged = self.settings.policy == NotificationPolicy::AutoMerge;
        let notification = Notification {
            count: fresh.len(),
            preview,
            merged,
        };
        if merged {
            let inserted = lock(&self.buffer).prepend(std::mem::take(&mut fresh));
            info!(inserted, "merged new entries on arrival");
        } else {
            info!(count = notification.count, "staged new entries");
        }

        let expires_at = self.scheduler.now() + self.settings.display_timeout;
        let mut slot = lock(&self.slot);
        slot.next_id += 1;
        slot.staged = Some(Staged {
            id: slot.next_id,
            entries: fresh,
            notification: notification.clone(),
            expires_at,
        });
        Some(notification)
    }

    /// Merge the staged entries into the feed. Returns how many were
    /// inserted; zero when nothing is staged or the banner has expired.
    pub fn accept(&self) -> usize {
        let Some(staged) = self.take_live() else {
            return 0;
        };
        if staged.entries.is_empty() {
            return 0;
        }
        let inserted = lock(&self.buffer).prepend(staged.entries);
        info!(inserted, "accepted new entries");
        inserted
    }

    /// Drop the pending batch without merging it.
    pub fn dismiss(&self) -> bool {
        let dismissed = self.take_live().is_some();
        if dismissed {
            debug!("dismissed new-entry banner");
        }
        dismissed
    }

    /// The banner to show right now, if any.
    pub fn current(&self) -> Option<Notification> {
        let mut slot = lock(&self.slot);
        self.expire(&mut slot.staged);
        slot.staged.as_ref().map(|s| s.notification.clone())
    }

    pub fn clear(&self) {
        lock(&self.slot).staged = None;
    }

    /// A future that waits for the pending banner's deadline on the
    /// scheduler clock and then clears it, unless it was accepted, dismissed
    /// or replaced in the meantime. Resolves to the cleared notification.
    pub fn expiry(&self) -> Option<BoxFuture<'static, Option<Notification>>> {
        let (id, deadline) = {
            let slot = lock(&self.slot);
            slot.staged.as_ref().map(|s| (s.id, s.expires_at))?
        };
        let slot = self.slot.clone();
        let scheduler = self.scheduler.clone();
        Some(
            async move {
                scheduler.sleep_until(deadline).await;
                let mut slot = lock(&slot);
                if !matches!(&slot.staged, Some(s) if s.id == id) {
                    return None;
                }
                debug!("new-entry banner timed out");
                slot.staged.take().map(|s| s.notification)
            }
            .boxed(),
        )
    }

    fn take_live(&self) -> Option<Staged> {
        let mut slot = lock(&self.slot);
        self.expire(&mut slot.staged);
        slot.staged.take()
    }

    fn expire(&self, staged: &mut Option<Staged>) {
        if matches!(staged, Some(s) if self.scheduler.now() >= s.expires_at) {
            debug!("new-entry banner timed out");
            *staged = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DisplayMeta;
    use crate::schedule::ManualScheduler;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    fn entry(id: &str, secs: i64, thumb: Option<&str>) -> Entry {
        Entry {
            identity: id.into(),
            source_id: "s".into(),
            published_at: Utc.timestamp_opt(secs, 0).unwrap(),
            display: DisplayMeta {
                source_title: None,
                thumbnail: thumb.map(str::to_string),
            },
            payload: Value::Null,
        }
    }

    fn setup(
        policy: NotificationPolicy,
    ) -> (NewEntryNotifier, ManualScheduler, Arc<Mutex<MergeBuffer>>) {
        let clock = ManualScheduler::new();
        let buffer = Arc::new(Mutex::new(MergeBuffer::new(100)));
        buffer
            .lock()
            .unwrap()
            .seed(vec![entry("e1", 100, None), entry("e2", 90, None)]);
        let notifier = NewEntryNotifier::new(
            NotifierSettings {
                policy,
                preview_count: 3,
                display_timeout: Duration::from_secs(15),
            },
            Arc::new(clock.clone()),
            buffer.clone(),
        );
        (notifier, clock, buffer)
    }

    #[test]
    fn stage_previews_newest_thumbnails_and_skips_known_entries() {
        let (notifier, _clock, buffer) = setup(NotificationPolicy::ExplicitAccept);
        let n = notifier
            .stage(vec![
                entry("e1", 100, Some("old.png")),
                entry("n1", 200, Some("1.png")),
                entry("n2", 300, None),
                entry("n3", 250, Some("3.png")),
                entry("n4", 150, Some("4.png")),
                entry("n5", 120, Some("5.png")),
                entry("n1", 200, Some("dup.png")),
            ])
            .unwrap();
        assert_eq!(n.count, 5);
        assert_eq!(n.preview, vec!["3.png", "1.png", "4.png"]);
        assert!(!n.merged);
        assert_eq!(buffer.lock().unwrap().len(), 2);
    }

    #[test]
    fn accept_prepends_and_clears() {
        let (notifier, _clock, buffer) = setup(NotificationPolicy::ExplicitAccept);
        notifier.stage(vec![entry("n1", 200, None)]);
        assert_eq!(notifier.accept(), 1);
        assert!(notifier.current().is_none());
        assert_eq!(buffer.lock().unwrap().entries()[0].identity, "n1");
        assert_eq!(notifier.accept(), 0);
    }

    #[test]
    fn new_batch_replaces_pending_one() {
        let (notifier, _clock, _buffer) = setup(NotificationPolicy::ExplicitAccept);
        notifier.stage(vec![entry("n1", 200, None)]);
        notifier.stage(vec![entry("n2", 210, None), entry("n3", 220, None)]);
        assert_eq!(notifier.current().unwrap().count, 2);
    }

    #[test]
    fn nothing_new_keeps_current_banner() {
        let (notifier, _clock, _buffer) = setup(NotificationPolicy::ExplicitAccept);
        notifier.stage(vec![entry("n1", 200, None)]);
        assert!(notifier.stage(vec![entry("e1", 100, None)]).is_none());
        assert_eq!(notifier.current().unwrap().count, 1);
    }

    #[test]
    fn banner_expires_on_the_scheduler_clock() {
        let (notifier, clock, buffer) = setup(NotificationPolicy::ExplicitAccept);
        notifier.stage(vec![entry("n1", 200, None)]);
        clock.advance(Duration::from_secs(14));
        assert!(notifier.current().is_some());
        clock.advance(Duration::from_secs(1));
        assert!(notifier.current().is_none());
        assert_eq!(notifier.accept(), 0);
        assert_eq!(buffer.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn expiry_clears_the_banner_it_was_armed_for() {
        let (notifier, clock, _buffer) = setup(NotificationPolicy::ExplicitAccept);
        let staged = notifier.stage(vec![entry("n1", 200, None)]).unwrap();
        let expiry = tokio::spawn(notifier.expiry().unwrap());
        tokio::task::yield_now().await;
        assert!(!expiry.is_finished());

        clock.advance(Duration::from_secs(15));
        assert_eq!(expiry.await.unwrap(), Some(staged));
        assert!(notifier.current().is_none());
    }

    #[tokio::test]
    async fn expiry_leaves_a_replacement_batch_alone() {
        let (notifier, clock, _buffer) = setup(NotificationPolicy::ExplicitAccept);
        notifier.stage(vec![entry("n1", 200, None)]);
        let expiry = notifier.expiry().unwrap();
        notifier.stage(vec![entry("n2", 210, None)]);

        clock.advance(Duration::from_secs(15));
        assert_eq!(expiry.await, None);
        assert!(notifier.expiry().is_some());
    }

    #[test]
    fn dismiss_drops_without_merging() {
        let (notifier, _clock, buffer) = setup(NotificationPolicy::ExplicitAccept);
        notifier.stage(vec![entry("n1", 200, None)]);
        assert!(notifier.dismiss());
        assert!(!notifier.dismiss());
        assert!(!buffer.lock().unwrap().contains("n1"));
    }

    #[test]
    fn auto_merge_prepends_on_stage() {
        let (notifier, _clock, buffer) = setup(NotificationPolicy::AutoMerge);
        let n = notifier.stage(vec![entry("n1", 200, Some("1.png"))]).unwrap();
        assert!(n.merged);
        assert_eq!(buffer.lock().unwrap().entries()[0].identity, "n1");
        assert_eq!(notifier.current(), Some(n));
        assert_eq!(notifier.accept(), 0);
        assert_eq!(buffer.lock().unwrap().len(), 3);
    }
}
