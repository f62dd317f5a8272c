//! Per-platform connection pool.
//!
//! Enforces the per-platform session cap, keeps a FIFO waiting queue for
//! overflow targets, and backfills from the queue whenever a session
//! closes.  A connect attempt reserves its slot for the attempt's whole
//! lifetime: a failed connect frees the slot and immediately drains the
//! queue; a protocol error never frees a slot until the session actually
//! reaches `Closed`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use sc_model::{BroadcastKey, ChatStats, LiveBroadcast, Platform, SessionEvent, Viewer};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};

use crate::session::{ChatSession, ConnectTarget};

struct PoolInner {
    connections: HashMap<BroadcastKey, ChatSession>,
    connecting: HashSet<BroadcastKey>,
    waiting: VecDeque<ConnectTarget>,
    /// Latest selector output; a connect that completes for a key no
    /// longer in here is closed on arrival.
    desired: HashSet<BroadcastKey>,
}

impl PoolInner {
    fn slots_used(&self) -> usize {
        self.connections.len() + self.connecting.len()
    }
}

struct PoolCtx {
    platform: Platform,
    cap: usize,
    inner: Mutex<PoolInner>,
    outbound_tx: mpsc::Sender<SessionEvent>,
    closed_tx: mpsc::UnboundedSender<BroadcastKey>,
}

/// One platform's session pool.
pub struct PoolManager {
    ctx: Arc<PoolCtx>,
    /// Reaper task: observes session closures, frees slots, backfills.
    _reaper: tokio::task::JoinHandle<()>,
}

impl PoolManager {
    /// `cap` is this platform's share of the total connection limit.
    /// Donations/subscriptions from every session flow out `outbound_tx`.
    pub fn new(platform: Platform, cap: usize, outbound_tx: mpsc::Sender<SessionEvent>) -> Self {
        let (closed_tx, closed_rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(PoolCtx {
            platform,
            cap,
            inner: Mutex::new(PoolInner {
                connections: HashMap::new(),
                connecting: HashSet::new(),
                waiting: VecDeque::new(),
                desired: HashSet::new(),
            }),
            outbound_tx,
            closed_tx,
        });
        let reaper = tokio::spawn(run_reaper(ctx.clone(), closed_rx));
        PoolManager {
            ctx,
            _reaper: reaper,
        }
    }

    /// Apply a new target set from the selector.
    ///
    /// Sessions for keys no longer targeted are closed (their slots free
    /// once the close completes); new keys connect if room exists, else
    /// queue FIFO.  Queued targets that fell out of the set are discarded.
    pub async fn update_targets(&self, targets: Vec<ConnectTarget>) {
        let desired: HashSet<BroadcastKey> =
            targets.iter().map(|t| t.broadcast.key.clone()).collect();
        let mut inner = self.ctx.inner.lock().await;
        inner.desired = desired.clone();

        let mut dropped = 0_usize;
        for (key, session) in &inner.connections {
            if !desired.contains(key) {
                session.close();
                dropped += 1;
            }
        }
        inner
            .waiting
            .retain(|t| desired.contains(&t.broadcast.key));

        let mut started = 0_usize;
        let mut queued = 0_usize;
        for target in targets {
            let key = &target.broadcast.key;
            if inner.connections.contains_key(key)
                || inner.connecting.contains(key)
                || inner.waiting.iter().any(|t| &t.broadcast.key == key)
            {
                continue;
            }
            if target.wire.is_none() {
                debug!(platform = %self.ctx.platform, broadcast = %key, "target without endpoint skipped");
                continue;
            }
            if inner.slots_used() < self.ctx.cap {
                spawn_connect(self.ctx.clone(), &mut inner, target);
                started += 1;
            } else {
                inner.waiting.push_back(target);
                queued += 1;
            }
        }
        info!(
            platform = %self.ctx.platform,
            active = inner.connections.len(),
            connecting = inner.connecting.len(),
            waiting = inner.waiting.len(),
            dropped, started, queued,
            "pool targets updated"
        );
    }

    /// Active + in-flight sessions; never exceeds the cap.
    pub async fn session_count(&self) -> usize {
        self.ctx.inner.lock().await.slots_used()
    }

    pub async fn waiting_count(&self) -> usize {
        self.ctx.inner.lock().await.waiting.len()
    }

    /// Keys currently holding a slot (connected or connecting).
    pub async fn current_keys(&self) -> HashSet<BroadcastKey> {
        let inner = self.ctx.inner.lock().await;
        inner
            .connections
            .keys()
            .chain(inner.connecting.iter())
            .cloned()
            .collect()
    }

    /// Snapshot every live session's viewer map.  No reset; non-blocking
    /// with respect to session I/O.
    pub async fn collect_viewer_lists(&self) -> Vec<(LiveBroadcast, Vec<Viewer>)> {
        let inner = self.ctx.inner.lock().await;
        inner
            .connections
            .values()
            .filter(|s| !s.is_closed())
            .map(|s| (s.broadcast().clone(), s.snapshot_viewers()))
            .collect()
    }

    /// Drain every live session's chat counters (this resets them).
    pub async fn collect_chat_stats(&self) -> Vec<(LiveBroadcast, ChatStats)> {
        let inner = self.ctx.inner.lock().await;
        inner
            .connections
            .values()
            .filter(|s| !s.is_closed())
            .map(|s| (s.broadcast().clone(), s.drain_chat_stats()))
            .collect()
    }

    /// Drain the buffered chat events from every session, including ones
    /// already closing (their backlog still deserves persistence).
    pub async fn drain_chat_events(&self) -> Vec<SessionEvent> {
        let inner = self.ctx.inner.lock().await;
        let mut events = Vec::new();
        let mut dropped_total = 0;
        for session in inner.connections.values() {
            events.extend(session.drain_chat_events());
            dropped_total += session.dropped_chat_events();
        }
        if dropped_total > 0 {
            warn!(platform = %self.ctx.platform, dropped_total, "chat events lost to backpressure");
        }
        events
    }

    /// Close every session and clear the queue (shutdown path).
    pub async fn disconnect_all(&self) {
        let mut inner = self.ctx.inner.lock().await;
        inner.waiting.clear();
        inner.desired.clear();
        for session in inner.connections.values() {
            session.close();
        }
        info!(platform = %self.ctx.platform, count = inner.connections.len(), "pool disconnecting");
    }
}

// ---------------------------------------------------------------------------
// Reaper + connect tasks
// ---------------------------------------------------------------------------

/// Remove closed sessions as they announce themselves, then drain the
/// waiting queue into the freed slots.
async fn run_reaper(ctx: Arc<PoolCtx>, mut closed_rx: mpsc::UnboundedReceiver<BroadcastKey>) {
    while let Some(key) = closed_rx.recv().await {
        let mut inner = ctx.inner.lock().await;
        let removed = match inner.connections.get(&key) {
            Some(session) if session.is_closed() => inner.connections.remove(&key).is_some(),
            _ => false,
        };
        if removed {
            debug!(platform = %ctx.platform, broadcast = %key, "session reaped");
        }
        fill_from_queue(&ctx, &mut inner);
    }
}

fn fill_from_queue(ctx: &Arc<PoolCtx>, inner: &mut PoolInner) {
    while inner.slots_used() < ctx.cap {
        let Some(target) = inner.waiting.pop_front() else {
            break;
        };
        let key = &target.broadcast.key;
        if inner.connections.contains_key(key) || inner.connecting.contains(key) {
            continue;
        }
        spawn_connect(ctx.clone(), inner, target);
    }
}

/// Reserve a slot and connect in the background.  The slot stays reserved
/// for the whole attempt; only failure or closure releases it.
fn spawn_connect(ctx: Arc<PoolCtx>, inner: &mut PoolInner, target: ConnectTarget) {
    let key = target.broadcast.key.clone();
    inner.connecting.insert(key.clone());
    tokio::spawn(async move {
        let result =
            ChatSession::connect(&target, ctx.outbound_tx.clone(), ctx.closed_tx.clone()).await;
        let mut inner = ctx.inner.lock().await;
        inner.connecting.remove(&key);
        match result {
            Ok(session) => {
                // The selector may have moved on while this attempt was in
                // flight; close immediately and let the reaper free the slot.
                if !inner.desired.contains(&key) {
                    debug!(platform = %ctx.platform, broadcast = %key, "late connect no longer targeted");
                    session.close();
                }
                debug!(platform = %ctx.platform, broadcast = %key, "session connected");
                inner.connections.insert(key, session);
            }
            Err(error) => {
                warn!(platform = %ctx.platform, broadcast = %key, %error, "session connect failed");
                fill_from_queue(&ctx, &mut inner);
            }
        }
    });
}
