// Queue Dispatcher (spec §4.6) — drains the persistent Broadcast Store queue
// on a heartbeat, paced by a global minimum inter-send interval, and owns the
// in-memory burst registry used for `BulkSend` and `/flush`. Grounded on the
// teacher's `engine/whatsapp/bridge.rs` poll loop: an `AtomicBool` stop flag,
// `tokio::time::interval`, one `tokio::spawn`'d task per long-running job.

use crate::config::{EngineConfig, GroupRegistry};
use crate::db::BroadcastDb;
use crate::error::EngineResult;
use crate::media::{MediaCache, MediaOwner};
use crate::transport::Transport;
use crate::types::{BroadcastRecord, BroadcastStatus, BurstEntry, ChatTarget, Draft, MediaHandle, QueueItem};
use chrono::{DateTime, Utc};
use log::{error, warn};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Notify};

/// Heartbeat period for the persistent-queue drain loop (spec §4.6: "wakes
/// at least every 60 seconds").
const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(60);

/// Random inter-send gap used by both `/flush` and a `BulkSend` burst
/// (spec §4.5.2, §4.6).
const FLUSH_DELAY_RANGE: std::ops::Range<u64> = 10..16;
const BULK_SEND_DELAY_RANGE: std::ops::Range<u64> = 15..31;

/// A row returned by `queue_listing` — deliberately erases whether the
/// entry lives in the persistent queue or the burst registry, since `/queue`
/// shows the operator one merged, time-ordered list (spec §4.6).
pub struct QueueRow {
    pub title: String,
    pub target: ChatTarget,
    pub fire_at: DateTime<Utc>,
    pub is_burst: bool,
}

pub struct Dispatcher {
    db: Arc<BroadcastDb>,
    media: Arc<MediaCache>,
    transport: Arc<dyn Transport>,
    config: Arc<EngineConfig>,
    groups: Arc<GroupRegistry>,
    bursts: Mutex<Vec<BurstEntry>>,
    next_burst_id: Mutex<u64>,
    last_send: Mutex<Option<DateTime<Utc>>>,
    notify: Notify,
    stop: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        db: Arc<BroadcastDb>,
        media: Arc<MediaCache>,
        transport: Arc<dyn Transport>,
        config: Arc<EngineConfig>,
        groups: Arc<GroupRegistry>,
    ) -> Arc<Self> {
        Arc::new(Dispatcher {
            db,
            media,
            transport,
            config,
            groups,
            bursts: Mutex::new(Vec::new()),
            next_burst_id: Mutex::new(1),
            last_send: Mutex::new(None),
            notify: Notify::new(),
            stop: AtomicBool::new(false),
        })
    }

    /// Wake the heartbeat loop immediately instead of waiting out the rest
    /// of its interval — called by the Router right after `db.enqueue`.
    pub fn notify_enqueued(&self) {
        self.notify.notify_one();
    }

    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    /// Background loop: process everything currently due, then sleep until
    /// the next heartbeat or an enqueue notification, whichever comes first.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        while !self.stop.load(Ordering::Relaxed) {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }
            if let Err(e) = self.drain_due().await {
                error!("[dispatcher] drain_due failed: {e}");
            }
        }
    }

    /// Send every persistent queue item whose scheduled time has passed,
    /// respecting the global minimum inter-send interval (spec §4.6). Stops
    /// early (rather than erroring) if the pacing guard isn't satisfied yet —
    /// the next heartbeat picks up where this left off.
    async fn drain_due(&self) -> EngineResult<()> {
        loop {
            if let Some(last) = *self.last_send.lock() {
                let min_gap = chrono::Duration::minutes(self.config.min_interval_minutes);
                if Utc::now() - last < min_gap {
                    return Ok(());
                }
            }
            let Some((item, record)) = self.db.next_due()? else { return Ok(()) };
            self.send_record(&item, &record).await;
        }
    }

    async fn send_record(&self, item: &QueueItem, record: &BroadcastRecord) {
        let target = ChatTarget::Production;
        match self.deliver(target, record).await {
            Ok(()) => {
                if let Err(e) = self.db.mark_sent(item.id) {
                    error!("[dispatcher] mark_sent({}) failed: {e}", item.id);
                }
                if let Err(e) = self.db.update_status(record.id, BroadcastStatus::Sent) {
                    error!("[dispatcher] update_status({}) failed: {e}", record.id);
                }
                *self.last_send.lock() = Some(Utc::now());
                self.release_record_media(record);
            }
            Err(e) => {
                warn!("[dispatcher] delivery of broadcast {} failed: {e}", record.id);
                if let Err(e) = self.db.mark_failed(item.id, &e.to_string()) {
                    error!("[dispatcher] mark_failed({}) failed: {e}", item.id);
                }
            }
        }
    }

    async fn deliver(&self, target: ChatTarget, record: &BroadcastRecord) -> EngineResult<()> {
        let chat_id = self.chat_id_for(target);
        match record.media_paths.first() {
            Some(path) => {
                let bytes = tokio::fs::read(path).await?;
                self.transport.send_image(&chat_id, bytes, Some(&record.description_generated)).await
            }
            None => self.transport.send_text(&chat_id, &record.description_generated).await,
        }
    }

    fn chat_id_for(&self, target: ChatTarget) -> String {
        self.groups.get(target)
    }

    fn release_record_media(&self, record: &BroadcastRecord) {
        for path in &record.media_paths {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                self.media.detach(&MediaHandle(name.to_string()), &MediaOwner::Broadcast(record.id));
            }
        }
    }

    fn release_burst_media(&self, broadcast_id: i64, media: &[MediaHandle]) {
        for handle in media {
            self.media.detach(handle, &MediaOwner::Broadcast(broadcast_id));
        }
    }

    /// `BulkSend` side effect: deliver every draft to `target` immediately,
    /// one after another with a random 15-30s gap, tracked in the burst
    /// registry so `/queue` and `/flush` can see/drain them (spec §4.5.2).
    /// Each item's `BroadcastRecord` must already be persisted (status
    /// `approved`) by the Router before this is called — a burst only
    /// flips that record to `sent` once it actually fires.
    pub fn fire_bulk_send(self: &Arc<Self>, target: ChatTarget, items: Vec<(i64, Draft, Vec<MediaHandle>)>) {
        let mut fire_at = Utc::now();
        let mut ids = Vec::with_capacity(items.len());
        {
            let mut bursts = self.bursts.lock();
            let mut next_id = self.next_burst_id.lock();
            for (broadcast_id, draft, media) in items {
                let gap = rand::thread_rng().gen_range(BULK_SEND_DELAY_RANGE.clone());
                fire_at += chrono::Duration::seconds(gap as i64);
                let id = *next_id;
                *next_id += 1;
                let (cancel, cancelled) = oneshot::channel();
                bursts.push(BurstEntry { id, broadcast_id, draft, media, target, fire_at, cancel });
                ids.push((id, fire_at, cancelled));
            }
        }
        for (id, fire_at, cancelled) in ids {
            let this = Arc::clone(self);
            tokio::spawn(async move { this.fire_one_burst(id, fire_at, cancelled).await });
        }
    }

    async fn fire_one_burst(self: &Arc<Self>, id: u64, fire_at: DateTime<Utc>, cancelled: oneshot::Receiver<()>) {
        let wait = (fire_at - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancelled => return,
        }

        let entry = {
            let mut bursts = self.bursts.lock();
            let pos = bursts.iter().position(|b| b.id == id);
            pos.map(|p| bursts.remove(p))
        };
        let Some(entry) = entry else { return };

        let chat_id = self.chat_id_for(entry.target);
        let result = match entry.media.first().and_then(|h| self.media.path_of(h)) {
            Some(path) => match tokio::fs::read(&path).await {
                Ok(bytes) => self.transport.send_image(&chat_id, bytes, Some(&entry.draft.body)).await,
                Err(e) => Err(crate::error::EngineError::Io(e)),
            },
            None => self.transport.send_text(&chat_id, &entry.draft.body).await,
        };
        match result {
            Ok(()) => {
                if let Err(e) = self.db.update_status(entry.broadcast_id, BroadcastStatus::Sent) {
                    error!("[dispatcher] update_status({}) failed: {e}", entry.broadcast_id);
                }
            }
            Err(e) => error!("[dispatcher] bulk-send burst {id} failed: {e}"),
        }
        self.release_burst_media(entry.broadcast_id, &entry.media);
    }

    /// `/queue`: persistent pending items plus active bursts, merged and
    /// sorted by fire time (spec §4.6).
    pub fn queue_listing(&self) -> EngineResult<Vec<QueueRow>> {
        let mut rows = Vec::new();
        for item in self.db.list_pending()? {
            if let Some(record) = self.db.get_broadcast(item.broadcast_id)? {
                rows.push(QueueRow { title: record.title, target: ChatTarget::Production, fire_at: item.scheduled_time, is_burst: false });
            }
        }
        for b in self.bursts.lock().iter() {
            rows.push(QueueRow {
                title: b.draft.body.chars().take(60).collect(),
                target: b.target,
                fire_at: b.fire_at,
                is_burst: true,
            });
        }
        rows.sort_by_key(|r| r.fire_at);
        Ok(rows)
    }

    /// `/flush`: drain the persistent queue and the burst registry right
    /// now, spacing sends 10-15s apart (spec §4.6).
    pub fn flush(self: &Arc<Self>) -> EngineResult<usize> {
        let pending = self.db.clear_pending()?;
        let mut records = Vec::with_capacity(pending.len());
        for item in &pending {
            if let Some(record) = self.db.get_broadcast(item.broadcast_id)? {
                records.push(record);
            }
        }
        let bursts: Vec<BurstEntry> = std::mem::take(&mut *self.bursts.lock());
        let count = records.len() + bursts.len();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            for record in records {
                this.deliver_and_settle(&record).await;
                this.sleep_flush_gap().await;
            }
            for entry in bursts {
                let chat_id = this.chat_id_for(entry.target);
                let result = match entry.media.first().and_then(|h| this.media.path_of(h)) {
                    Some(path) => match tokio::fs::read(&path).await {
                        Ok(bytes) => this.transport.send_image(&chat_id, bytes, Some(&entry.draft.body)).await,
                        Err(e) => Err(crate::error::EngineError::Io(e)),
                    },
                    None => this.transport.send_text(&chat_id, &entry.draft.body).await,
                };
                match result {
                    Ok(()) => {
                        if let Err(e) = this.db.update_status(entry.broadcast_id, BroadcastStatus::Sent) {
                            error!("[dispatcher] update_status({}) failed: {e}", entry.broadcast_id);
                        }
                    }
                    Err(e) => error!("[dispatcher] flush of burst {} failed: {e}", entry.id),
                }
                this.release_burst_media(entry.broadcast_id, &entry.media);
                this.sleep_flush_gap().await;
            }
        });
        Ok(count)
    }

    async fn deliver_and_settle(&self, record: &BroadcastRecord) {
        match self.deliver(ChatTarget::Production, record).await {
            Ok(()) => {
                if let Err(e) = self.db.update_status(record.id, BroadcastStatus::Sent) {
                    error!("[dispatcher] update_status({}) failed: {e}", record.id);
                }
                self.release_record_media(record);
            }
            Err(e) => error!("[dispatcher] flush delivery of broadcast {} failed: {e}", record.id),
        }
    }

    async fn sleep_flush_gap(&self) {
        let gap = rand::thread_rng().gen_range(FLUSH_DELAY_RANGE.clone());
        tokio::time::sleep(std::time::Duration::from_secs(gap)).await;
    }

    /// Cancel a still-pending burst by id, e.g. from a future `/cancel N`
    /// extension to `/queue`. Returns whether anything was removed.
    pub fn cancel_burst(&self, id: u64) -> bool {
        let mut bursts = self.bursts.lock();
        if let Some(pos) = bursts.iter().position(|b| b.id == id) {
            let entry = bursts.remove(pos);
            let _ = entry.cancel.send(());
            self.release_burst_media(entry.broadcast_id, &entry.media);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::GroupInfo;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct FakeTransport {
        texts_sent: AtomicUsize,
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn send_text(&self, _chat_id: &str, _text: &str) -> EngineResult<()> {
            self.texts_sent.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
        async fn send_image(&self, _chat_id: &str, _bytes: Vec<u8>, _caption: Option<&str>) -> EngineResult<()> {
            Ok(())
        }
        async fn list_groups(&self) -> EngineResult<Vec<GroupInfo>> {
            Ok(Vec::new())
        }
        async fn download_media(&self, _media_url: &str) -> EngineResult<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn make_dispatcher() -> (Arc<Dispatcher>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = Arc::new(BroadcastDb::open_in_memory().unwrap());
        let media = Arc::new(MediaCache::open(dir.path()).unwrap());
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport { texts_sent: AtomicUsize::new(0) });
        let mut config = EngineConfig::default();
        config.production_chat_id = "grp-prod".into();
        config.min_interval_minutes = 0;
        let groups = Arc::new(GroupRegistry::new(&config));
        let dispatcher = Dispatcher::new(db, media, transport, Arc::new(config), groups);
        (dispatcher, dir)
    }

    #[tokio::test]
    async fn drain_due_sends_and_marks_sent() {
        let (dispatcher, _dir) = make_dispatcher();
        let record = BroadcastRecord {
            id: 0,
            title: "A Book".into(),
            title_normalized: "a book".into(),
            price_main: 100_000,
            price_secondary: None,
            format: None,
            eta: None,
            close_date: None,
            supplier_type: None,
            description_source: "raw".into(),
            description_generated: "Great book!".into(),
            tags: Vec::new(),
            preview_links: Vec::new(),
            media_paths: Vec::new(),
            status: BroadcastStatus::Approved,
            created_at: String::new(),
            sent_at: None,
        };
        let id = dispatcher.db.save_broadcast(&record).unwrap();
        dispatcher.db.enqueue(id, Utc::now()).unwrap();

        dispatcher.drain_due().await.unwrap();

        assert!(dispatcher.db.list_pending().unwrap().is_empty());
        let updated = dispatcher.db.get_broadcast(id).unwrap().unwrap();
        assert_eq!(updated.status, BroadcastStatus::Sent);
    }

    #[tokio::test]
    async fn queue_listing_merges_pending_and_bursts() {
        let (dispatcher, _dir) = make_dispatcher();
        let record = BroadcastRecord {
            id: 0,
            title: "Burst Book".into(),
            title_normalized: "burst book".into(),
            price_main: 50_000,
            price_secondary: None,
            format: None,
            eta: None,
            close_date: None,
            supplier_type: None,
            description_source: "raw".into(),
            description_generated: "Burst draft".into(),
            tags: Vec::new(),
            preview_links: Vec::new(),
            media_paths: Vec::new(),
            status: BroadcastStatus::Approved,
            created_at: String::new(),
            sent_at: None,
        };
        let broadcast_id = dispatcher.db.save_broadcast(&record).unwrap();
        let draft = Draft { body: "Burst draft".into(), level: crate::types::Level::Persuasive, preview_links: Vec::new(), cover: None };
        dispatcher.fire_bulk_send(ChatTarget::Production, vec![(broadcast_id, draft, Vec::new())]);
        // fire_bulk_send spawns immediately; give the registry a moment to populate.
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        let rows = dispatcher.queue_listing().unwrap();
        assert!(rows.iter().any(|r| r.is_burst));
    }
}
