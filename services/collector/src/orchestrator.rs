//! Collector orchestrator.
//!
//! Owns the two pool managers, the shared warehouse, and the two periodic
//! schedules:
//!
//! - **Poll** (every `poll_interval`, first run immediate): enumerate live
//!   broadcasts on both platforms in parallel under a 60 s deadline,
//!   upsert broadcasters/broadcasts, write bucketed snapshots, detect
//!   title/category changes and ended broadcasts, then hand the selector
//!   output to the pools.
//! - **Snapshot** (every `snapshot_interval`, first run +30 s): read each
//!   live session's viewer map, drain its chat counters, and persist
//!   viewing records + per-bucket stats in one transaction per broadcast.
//!
//! Donations are event-driven: sessions push them through a channel and
//! they persist as they arrive, no retry on failure.
//!
//! Failure containment: sessions never crash pools, pools never crash the
//! orchestrator, and the only fatal condition is warehouse unavailability
//! at startup.  Mid-run outages buffer snapshot batches up to a bound,
//! dropping oldest beyond it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sc_model::{
    BroadcastKey, ChannelEvent, ChatStats, LiveBroadcast, Platform, SessionEvent,
};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::api::chzzk::ChzzkApi;
use crate::api::soop::SoopApi;
use crate::config::CollectorConfig;
use crate::pool::PoolManager;
use crate::repo::{broadcasts, categories, events, persons, snapshots, stats};
use crate::session::{ConnectTarget, WireTarget};
use crate::warehouse::{Statement, Warehouse, WarehouseError};

/// Hard deadline for one platform's poll.
const API_POLL_TIMEOUT: Duration = Duration::from_secs(60);
/// Snapshot schedule starts this long after boot.
const SNAPSHOT_START_DELAY: Duration = Duration::from_secs(30);
/// Shutdown must complete within this bound; stragglers are abandoned.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);
/// Session-to-orchestrator channel depth (donations/subscriptions).
const OUTBOUND_CHANNEL_CAP: usize = 1024;
/// Snapshot batches held in memory across a warehouse outage.
const PENDING_BATCH_CAP: usize = 256;

// ---------------------------------------------------------------------------
// Pure helpers (selector, buckets, lifecycle diff)
// ---------------------------------------------------------------------------

/// Floor a wall-clock instant to its bucket boundary.
pub fn floor_bucket(at: DateTime<Utc>, interval_secs: u64) -> DateTime<Utc> {
    let interval = i64::try_from(interval_secs.max(1)).unwrap_or(300);
    let secs = at.timestamp();
    let floored = secs - secs.rem_euclid(interval);
    DateTime::<Utc>::from_timestamp(floored, 0).unwrap_or(at)
}

/// Selector: broadcasts at or above the viewer threshold, by viewer count
/// descending, capped at the pool share.
pub fn select_targets(
    broadcasts: &[LiveBroadcast],
    min_viewers: i64,
    cap: usize,
) -> Vec<LiveBroadcast> {
    let mut eligible: Vec<LiveBroadcast> = broadcasts
        .iter()
        .filter(|b| b.viewers >= min_viewers)
        .cloned()
        .collect();
    eligible.sort_by(|a, b| b.viewers.cmp(&a.viewers));
    eligible.truncate(cap);
    eligible
}

/// Keys live last poll but absent from this one.
pub fn ended_keys(
    previous: &HashSet<BroadcastKey>,
    current: &HashSet<BroadcastKey>,
) -> Vec<BroadcastKey> {
    previous.difference(current).cloned().collect()
}

// ---------------------------------------------------------------------------
// Collector
// ---------------------------------------------------------------------------

/// Cached per-broadcast metadata between polls; the source of truth for
/// change detection and warehouse surrogate ids.
#[derive(Debug, Clone)]
struct BroadcastMeta {
    broadcast_id: i64,
    segment_id: Option<i64>,
    title: String,
    category_id: Option<String>,
    category_name: Option<String>,
}

pub struct Collector {
    cfg: CollectorConfig,
    warehouse: Arc<Warehouse>,
    soop_api: SoopApi,
    chzzk_api: ChzzkApi,
    soop_pool: PoolManager,
    chzzk_pool: PoolManager,
    outbound_rx: Option<mpsc::Receiver<SessionEvent>>,
    meta_cache: HashMap<BroadcastKey, BroadcastMeta>,
    live_keys: HashMap<Platform, HashSet<BroadcastKey>>,
    pending_batches: VecDeque<Vec<Statement>>,
    pending_dropped: u64,
}

impl Collector {
    pub fn new(cfg: CollectorConfig, warehouse: Warehouse) -> Collector {
        Self::with_apis(cfg, warehouse, SoopApi::new(), ChzzkApi::new())
    }

    /// Construct with explicit API clients (tests point these at local
    /// mock servers).
    pub fn with_apis(
        cfg: CollectorConfig,
        warehouse: Warehouse,
        soop_api: SoopApi,
        chzzk_api: ChzzkApi,
    ) -> Collector {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAP);
        let cap = cfg.per_platform_cap();
        let soop_pool = PoolManager::new(Platform::Soop, cap, outbound_tx.clone());
        let chzzk_pool = PoolManager::new(Platform::Chzzk, cap, outbound_tx);
        Collector {
            cfg,
            warehouse: Arc::new(warehouse),
            soop_api,
            chzzk_api,
            soop_pool,
            chzzk_pool,
            outbound_rx: Some(outbound_rx),
            meta_cache: HashMap::new(),
            live_keys: HashMap::new(),
            pending_batches: VecDeque::new(),
            pending_dropped: 0,
        }
    }

    fn pool(&self, platform: Platform) -> &PoolManager {
        match platform {
            Platform::Soop => &self.soop_pool,
            Platform::Chzzk => &self.chzzk_pool,
        }
    }

    /// Run both schedules until the shutdown signal flips, then close
    /// everything within the shutdown bound.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), WarehouseError> {
        self.startup_recovery().await?;

        let mut outbound_rx = self
            .outbound_rx
            .take()
            .unwrap_or_else(|| mpsc::channel(1).1);
        let mut poll = tokio::time::interval(Duration::from_secs(self.cfg.poll_interval_secs));
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut snapshot = tokio::time::interval_at(
            Instant::now() + SNAPSHOT_START_DELAY,
            Duration::from_secs(self.cfg.snapshot_interval_secs),
        );
        snapshot.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            poll_secs = self.cfg.poll_interval_secs,
            snapshot_secs = self.cfg.snapshot_interval_secs,
            cap = self.cfg.max_ws_connections,
            min_viewers = self.cfg.min_viewers_threshold,
            "collector running"
        );

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = poll.tick() => self.run_poll_cycle().await,
                _ = snapshot.tick() => self.run_snapshot_cycle().await,
                event = outbound_rx.recv() => {
                    match event {
                        Some(event) => self.handle_session_event(event).await,
                        None => break,
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// Close out state left behind by an unclean shutdown.  Warehouse
    /// unavailability here is fatal; anything else is logged and skipped.
    async fn startup_recovery(&self) -> Result<(), WarehouseError> {
        let now = Utc::now();
        for stmt in [
            broadcasts::close_stale_live(now),
            broadcasts::close_stale_segments(now),
        ] {
            match self.warehouse.run(&stmt).await {
                Ok(rows) if rows > 0 => info!(rows, "stale live state closed at startup"),
                Ok(_) => {}
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => warn!(%err, "startup recovery statement failed"),
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Schedule A: API poll
    // -----------------------------------------------------------------------

    async fn run_poll_cycle(&mut self) {
        let started = Instant::now();
        let (soop, chzzk) = tokio::join!(
            tokio::time::timeout(API_POLL_TIMEOUT, self.soop_api.list_live_broadcasts()),
            tokio::time::timeout(API_POLL_TIMEOUT, self.chzzk_api.list_live_broadcasts()),
        );
        let soop = soop.unwrap_or_else(|_| {
            warn!("SOOP poll hit the 60 s deadline");
            Vec::new()
        });
        let chzzk = chzzk.unwrap_or_else(|_| {
            warn!("CHZZK poll hit the 60 s deadline");
            Vec::new()
        });

        self.process_platform(Platform::Soop, soop).await;
        self.process_platform(Platform::Chzzk, chzzk).await;
        debug!(elapsed_ms = started.elapsed().as_millis() as u64, "poll cycle done");
    }

    async fn process_platform(&mut self, platform: Platform, broadcasts: Vec<LiveBroadcast>) {
        if broadcasts.is_empty() {
            // An empty index and a failed poll are indistinguishable here;
            // skipping keeps a transient API failure from mass-ending
            // every broadcast on the platform.
            warn!(%platform, "empty live index, platform skipped this cycle");
            return;
        }
        let now = Utc::now();
        let bucket = floor_bucket(now, self.cfg.snapshot_interval_secs);
        let current: HashSet<BroadcastKey> = broadcasts.iter().map(|b| b.key.clone()).collect();

        for broadcast in &broadcasts {
            if let Err(err) = self.ingest_broadcast(broadcast, now, bucket).await {
                warn!(broadcast = %broadcast.key, %err, "broadcast ingest failed");
            }
        }

        let previous = self
            .live_keys
            .insert(platform, current.clone())
            .unwrap_or_default();
        for key in ended_keys(&previous, &current) {
            self.finish_broadcast(&key, now).await;
        }

        let selected = select_targets(
            &broadcasts,
            self.cfg.min_viewers_threshold,
            self.cfg.per_platform_cap(),
        );
        let targets = self.resolve_targets(platform, selected).await;
        self.pool(platform).update_targets(targets).await;

        info!(
            %platform,
            live = current.len(),
            sessions = self.pool(platform).session_count().await,
            "platform poll processed"
        );
    }

    /// Upsert one observed broadcast and its bucketed snapshot; maintain
    /// the meta cache, change rows, and segments.
    async fn ingest_broadcast(
        &mut self,
        broadcast: &LiveBroadcast,
        now: DateTime<Utc>,
        bucket: DateTime<Utc>,
    ) -> Result<(), WarehouseError> {
        self.warehouse
            .merge(&persons::upsert_broadcaster(broadcast, now))
            .await?;
        self.warehouse
            .merge(&broadcasts::upsert_broadcast(broadcast, now))
            .await?;
        if let (Some(category_id), Some(category_name)) =
            (&broadcast.category_id, &broadcast.category_name)
        {
            if let Err(err) = self
                .warehouse
                .merge(&categories::upsert_category(
                    broadcast.key.platform,
                    category_id,
                    category_name,
                    now,
                ))
                .await
            {
                warn!(%category_id, %err, "category upsert failed");
            }
        }

        let meta = match self.meta_cache.get(&broadcast.key).cloned() {
            None => {
                let Some(broadcast_id) =
                    broadcasts::broadcast_id(&self.warehouse, &broadcast.key).await?
                else {
                    warn!(broadcast = %broadcast.key, "broadcast row missing after upsert");
                    return Ok(());
                };
                // First observation by this process: any segment still open
                // belongs to an interrupted run and is closed first, keeping
                // at most one open segment per broadcast.
                self.warehouse
                    .run(&broadcasts::close_open_segment(broadcast_id, now))
                    .await?;
                self.warehouse
                    .run(&broadcasts::open_segment(broadcast_id, broadcast, now))
                    .await?;
                let segment_id = broadcasts::open_segment_id(&self.warehouse, broadcast_id).await?;
                BroadcastMeta {
                    broadcast_id,
                    segment_id,
                    title: broadcast.title.clone(),
                    category_id: broadcast.category_id.clone(),
                    category_name: broadcast.category_name.clone(),
                }
            }
            Some(prev) => {
                let mut segment_id = prev.segment_id;
                if prev.title != broadcast.title {
                    self.warehouse
                        .run(&broadcasts::record_change(
                            prev.broadcast_id,
                            "title",
                            &prev.title,
                            &broadcast.title,
                            now,
                        ))
                        .await?;
                }
                let category_changed = prev.category_id != broadcast.category_id
                    || prev.category_name != broadcast.category_name;
                if category_changed {
                    self.warehouse
                        .run(&broadcasts::record_change(
                            prev.broadcast_id,
                            "category",
                            &category_label(&prev.category_id, &prev.category_name),
                            &category_label(&broadcast.category_id, &broadcast.category_name),
                            now,
                        ))
                        .await?;
                    self.warehouse
                        .run(&broadcasts::close_open_segment(prev.broadcast_id, now))
                        .await?;
                    self.warehouse
                        .run(&broadcasts::open_segment(prev.broadcast_id, broadcast, now))
                        .await?;
                    segment_id =
                        broadcasts::open_segment_id(&self.warehouse, prev.broadcast_id).await?;
                }
                BroadcastMeta {
                    broadcast_id: prev.broadcast_id,
                    segment_id,
                    title: broadcast.title.clone(),
                    category_id: broadcast.category_id.clone(),
                    category_name: broadcast.category_name.clone(),
                }
            }
        };

        self.warehouse
            .run(&broadcasts::bump_segment_peak(
                meta.broadcast_id,
                broadcast.viewers,
            ))
            .await?;
        self.warehouse
            .merge(&snapshots::save_broadcast_snapshot(
                meta.broadcast_id,
                meta.segment_id,
                broadcast,
                bucket,
            ))
            .await?;
        self.meta_cache.insert(broadcast.key.clone(), meta);
        Ok(())
    }

    /// A broadcast disappeared from the index: close it out.
    async fn finish_broadcast(&mut self, key: &BroadcastKey, now: DateTime<Utc>) {
        match self.warehouse.run(&broadcasts::mark_broadcast_ended(key, now)).await {
            Ok(rows) => {
                if rows > 0 {
                    info!(broadcast = %key, "broadcast ended");
                }
            }
            Err(err) => warn!(broadcast = %key, %err, "mark-ended failed"),
        }
        if let Some(meta) = self.meta_cache.remove(key) {
            if let Err(err) = self
                .warehouse
                .run(&broadcasts::close_open_segment(meta.broadcast_id, now))
                .await
            {
                warn!(broadcast = %key, %err, "segment close failed");
            }
        }
    }

    /// Build connect targets for the selected broadcasts, fetching chat
    /// coordinates only for keys not already holding a pool slot.
    async fn resolve_targets(
        &self,
        platform: Platform,
        selected: Vec<LiveBroadcast>,
    ) -> Vec<ConnectTarget> {
        let current = self.pool(platform).current_keys().await;
        let mut targets = Vec::with_capacity(selected.len());
        for broadcast in selected {
            if current.contains(&broadcast.key) {
                targets.push(ConnectTarget {
                    broadcast,
                    wire: None,
                });
                continue;
            }
            let wire = match platform {
                Platform::Soop => self
                    .soop_api
                    .fetch_chat_coordinates(&broadcast.streamer_id)
                    .await
                    .map(|coords| WireTarget::Soop {
                        ws_url: coords.ws_url(&broadcast.streamer_id),
                        chat_room_id: coords.chat_no,
                    }),
                Platform::Chzzk => self
                    .chzzk_api
                    .fetch_chat_coordinates(&broadcast.key.channel_id)
                    .await
                    .map(|coords| WireTarget::Chzzk {
                        ws_url: coords.ws_url(),
                        chat_channel_id: coords.chat_channel_id,
                    }),
            };
            match wire {
                Some(wire) => targets.push(ConnectTarget {
                    broadcast,
                    wire: Some(wire),
                }),
                None => debug!(broadcast = %broadcast.key, "no chat coordinates, skipped this cycle"),
            }
        }
        targets
    }

    // -----------------------------------------------------------------------
    // Schedule B: snapshot
    // -----------------------------------------------------------------------

    async fn run_snapshot_cycle(&mut self) {
        let now = Utc::now();
        let bucket = floor_bucket(now, self.cfg.snapshot_interval_secs);
        self.flush_pending().await;

        for platform in [Platform::Soop, Platform::Chzzk] {
            let (viewer_lists, chat_stats, chat_events) = {
                let pool = self.pool(platform);
                (
                    pool.collect_viewer_lists().await,
                    pool.collect_chat_stats().await,
                    pool.drain_chat_events().await,
                )
            };

            let mut stats_by_key: HashMap<BroadcastKey, ChatStats> = chat_stats
                .into_iter()
                .map(|(b, s)| (b.key, s))
                .collect();

            for (broadcast, viewers) in viewer_lists {
                let drained = stats_by_key.remove(&broadcast.key).unwrap_or_default();
                let Some(meta) = self.meta_cache.get(&broadcast.key).cloned() else {
                    debug!(broadcast = %broadcast.key, "session without meta cache, snapshot skipped");
                    continue;
                };
                let batch =
                    self.build_snapshot_batch(&broadcast, &meta, &viewers, drained, bucket, now);
                self.persist_snapshot_batch(batch).await;
            }
            self.persist_chat_events(platform, chat_events, now).await;
        }
        debug!(bucket = %bucket, "snapshot cycle done");
    }

    /// All writes for one (broadcast, bucket): viewer person upserts,
    /// viewing records, the stats merge, and the snapshot chat-rate merge.
    /// Committed as one transaction.
    fn build_snapshot_batch(
        &self,
        broadcast: &LiveBroadcast,
        meta: &BroadcastMeta,
        viewers: &[sc_model::Viewer],
        drained: ChatStats,
        bucket: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<Statement> {
        let platform = broadcast.key.platform;
        let mut batch = Vec::with_capacity(viewers.len() * 2 + 2);
        for viewer in viewers {
            batch.push(
                persons::upsert_person(platform, &viewer.user_id, &viewer.nickname, now)
                    .to_statement(),
            );
            batch.push(snapshots::insert_viewing_record(
                &viewer.user_id,
                platform.as_str(),
                meta.broadcast_id,
                bucket,
                viewer.is_subscriber,
                viewer.is_fan,
            ));
        }
        let bucket_stats = stats::BucketStats {
            viewer_count: viewers.len() as i64,
            subscriber_count: viewers.iter().filter(|v| v.is_subscriber).count() as i64,
            fan_count: viewers.iter().filter(|v| v.is_fan).count() as i64,
            chat_count: drained.message_count as i64,
            unique_chatters: drained.unique_chatters as i64,
        };
        batch.push(stats::merge_stats_5min(meta.broadcast_id, bucket, bucket_stats).to_statement());
        let chat_rate = chat_rate_per_minute(
            drained.message_count,
            self.cfg.snapshot_interval_secs,
        );
        batch.push(
            snapshots::merge_snapshot_chat_rate(
                meta.broadcast_id,
                broadcast,
                bucket,
                viewers.len() as i64,
                chat_rate,
            )
            .to_statement(),
        );
        batch
    }

    async fn persist_snapshot_batch(&mut self, batch: Vec<Statement>) {
        match self.warehouse.run_in_transaction(&batch).await {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                error!(%err, buffered = self.pending_batches.len(), "warehouse unavailable, buffering snapshot");
                self.buffer_pending(batch);
            }
            Err(err) => {
                // Idempotent writes: the next cycle rewrites this bucket.
                warn!(%err, "snapshot batch failed, dropped");
            }
        }
    }

    fn buffer_pending(&mut self, batch: Vec<Statement>) {
        if self.pending_batches.len() >= PENDING_BATCH_CAP {
            self.pending_batches.pop_front();
            self.pending_dropped += 1;
            warn!(
                dropped_total = self.pending_dropped,
                "pending buffer full, oldest snapshot dropped; collector unhealthy"
            );
        }
        self.pending_batches.push_back(batch);
    }

    /// Replay buffered snapshot batches once the warehouse answers again.
    async fn flush_pending(&mut self) {
        while let Some(batch) = self.pending_batches.pop_front() {
            match self.warehouse.run_in_transaction(&batch).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() => {
                    self.pending_batches.push_front(batch);
                    warn!(%err, remaining = self.pending_batches.len(), "warehouse still unavailable");
                    return;
                }
                Err(err) => warn!(%err, "buffered snapshot dropped"),
            }
        }
    }

    /// Append drained chat events and fold them into engagement totals.
    async fn persist_chat_events(
        &mut self,
        platform: Platform,
        chat_events: Vec<SessionEvent>,
        now: DateTime<Utc>,
    ) {
        if chat_events.is_empty() {
            return;
        }
        let mut rows = Vec::with_capacity(chat_events.len());
        let mut engagement: HashMap<(String, String, Option<String>), i64> = HashMap::new();
        for event in &chat_events {
            let ChannelEvent::Chat(chat) = &event.event else {
                continue;
            };
            let broadcast_id = self
                .meta_cache
                .get(&event.broadcast)
                .map(|m| m.broadcast_id);
            rows.push(events::chat_event_row(
                chat,
                &event.broadcast,
                &event.streamer_id,
                broadcast_id,
                event.at,
                now,
            ));
            let category = self
                .meta_cache
                .get(&event.broadcast)
                .and_then(|m| m.category_id.clone());
            *engagement
                .entry((
                    chat.user_id.clone(),
                    event.broadcast.channel_id.clone(),
                    category,
                ))
                .or_insert(0) += 1;
        }

        match self
            .warehouse
            .batch_insert("events", events::CHAT_EVENT_COLS, &rows)
            .await
        {
            Ok(inserted) => debug!(%platform, inserted, "chat events appended"),
            Err(err) => warn!(%platform, %err, "chat event batch failed"),
        }

        for ((user_id, channel_id, category), chat_delta) in engagement {
            if let Err(err) = self
                .warehouse
                .merge(&events::bump_engagement(
                    platform,
                    &user_id,
                    &channel_id,
                    category.as_deref(),
                    chat_delta,
                    0,
                    0,
                    now,
                ))
                .await
            {
                warn!(%err, "engagement bump failed");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Donation path (event-driven)
    // -----------------------------------------------------------------------

    async fn handle_session_event(&mut self, event: SessionEvent) {
        let now = Utc::now();
        let platform = event.broadcast.platform;
        match &event.event {
            ChannelEvent::Donation(donation) => {
                if let Err(err) = self
                    .warehouse
                    .merge(&persons::upsert_person(
                        platform,
                        &donation.user_id,
                        &donation.nickname,
                        now,
                    ))
                    .await
                {
                    warn!(%err, "donor upsert failed");
                }
                match self
                    .warehouse
                    .run(&events::insert_donation(
                        donation,
                        &event.broadcast,
                        &event.streamer_id,
                        event.at,
                        now,
                    ))
                    .await
                {
                    Ok(0) => debug!(broadcast = %event.broadcast, "donation for unknown broadcast dropped"),
                    Ok(_) => {}
                    Err(err) => warn!(%err, "donation insert failed"),
                }
                let category = self
                    .meta_cache
                    .get(&event.broadcast)
                    .and_then(|m| m.category_id.clone());
                if let Err(err) = self
                    .warehouse
                    .merge(&events::bump_engagement(
                        platform,
                        &donation.user_id,
                        &event.broadcast.channel_id,
                        category.as_deref(),
                        0,
                        1,
                        donation.amount_krw,
                        now,
                    ))
                    .await
                {
                    warn!(%err, "engagement bump failed");
                }
            }
            ChannelEvent::Subscription(subscription) => {
                if let Err(err) = self
                    .warehouse
                    .merge(&persons::upsert_person(
                        platform,
                        &subscription.user_id,
                        &subscription.nickname,
                        now,
                    ))
                    .await
                {
                    warn!(%err, "subscriber upsert failed");
                }
                if let Err(err) = self
                    .warehouse
                    .run(&events::insert_subscription(
                        subscription,
                        &event.broadcast,
                        &event.streamer_id,
                        event.at,
                        now,
                    ))
                    .await
                {
                    warn!(%err, "subscription insert failed");
                }
            }
            _ => {}
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    async fn shutdown(&mut self) {
        info!("collector stopping");
        tokio::join!(
            self.soop_pool.disconnect_all(),
            self.chzzk_pool.disconnect_all()
        );
        let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
        loop {
            let open =
                self.soop_pool.session_count().await + self.chzzk_pool.session_count().await;
            if open == 0 {
                break;
            }
            if Instant::now() >= deadline {
                warn!(open, "shutdown deadline hit, abandoning open sessions");
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        self.warehouse.close().await;
        info!("collector stopped");
    }
}

fn category_label(category_id: &Option<String>, category_name: &Option<String>) -> String {
    category_name
        .clone()
        .or_else(|| category_id.clone())
        .unwrap_or_default()
}

fn chat_rate_per_minute(message_count: u64, interval_secs: u64) -> f64 {
    message_count as f64 * 60.0 / interval_secs.max(1) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn broadcast(channel: &str, viewers: i64) -> LiveBroadcast {
        LiveBroadcast {
            key: BroadcastKey {
                platform: Platform::Soop,
                channel_id: channel.to_owned(),
                broadcast_no: format!("{channel}-b"),
            },
            streamer_id: channel.to_owned(),
            streamer_nick: channel.to_owned(),
            title: "t".to_owned(),
            category_id: None,
            category_name: None,
            tags: vec![],
            thumbnail: None,
            viewers,
            started_at: None,
        }
    }

    #[test]
    fn bucket_floor_aligns_to_interval() {
        let at = Utc.with_ymd_and_hms(2026, 2, 1, 12, 7, 44).unwrap();
        let bucket = floor_bucket(at, 300);
        assert_eq!(bucket, Utc.with_ymd_and_hms(2026, 2, 1, 12, 5, 0).unwrap());
        assert_eq!(bucket.timestamp() % 300, 0);
        // A boundary instant floors to itself.
        assert_eq!(floor_bucket(bucket, 300), bucket);
    }

    #[test]
    fn selector_takes_top_by_viewers_above_threshold() {
        // Cold-start scenario: 500/200/50 viewers, threshold 100, cap 2.
        let all = vec![
            broadcast("mid", 200),
            broadcast("big", 500),
            broadcast("small", 50),
        ];
        let selected = select_targets(&all, 100, 2);
        assert_eq!(selected.len(), 2);
        assert_eq!(selected[0].key.channel_id, "big");
        assert_eq!(selected[1].key.channel_id, "mid");
    }

    #[test]
    fn selector_cap_binds_before_threshold_count() {
        let all: Vec<LiveBroadcast> = (0..10)
            .map(|i| broadcast(&format!("ch{i}"), 1000 + i64::from(i)))
            .collect();
        let selected = select_targets(&all, 100, 4);
        assert_eq!(selected.len(), 4);
        assert!(selected.windows(2).all(|w| w[0].viewers >= w[1].viewers));
    }

    #[test]
    fn selector_empty_when_all_below_threshold() {
        let all = vec![broadcast("a", 5), broadcast("b", 99)];
        assert!(select_targets(&all, 100, 4).is_empty());
    }

    #[test]
    fn ended_diff_finds_disappeared_keys() {
        let b1 = broadcast("a", 1).key;
        let b2 = broadcast("b", 1).key;
        let b3 = broadcast("c", 1).key;
        let previous: HashSet<_> = [b1.clone(), b2.clone()].into_iter().collect();
        let current: HashSet<_> = [b2, b3].into_iter().collect();
        let ended = ended_keys(&previous, &current);
        assert_eq!(ended, vec![b1]);
    }

    #[test]
    fn chat_rate_is_messages_per_minute() {
        assert!((chat_rate_per_minute(42, 300) - 8.4).abs() < 1e-9);
        assert_eq!(chat_rate_per_minute(0, 300), 0.0);
    }

    #[test]
    fn category_label_prefers_name() {
        assert_eq!(
            category_label(&Some("id1".to_owned()), &Some("Name".to_owned())),
            "Name"
        );
        assert_eq!(category_label(&Some("id1".to_owned()), &None), "id1");
        assert_eq!(category_label(&None, &None), "");
    }
}
