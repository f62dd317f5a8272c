//! Chat session: one per selected broadcast.
//!
//! A session owns exactly one WebSocket, its ping timer, its rolling
//! viewer map, and its chat-rate counters.  The read loop is generic over
//! `Stream + Sink` so tests drive it against mock servers.
//!
//! # Lifecycle
//! `Connecting → Handshaking → Connected → Closing → Closed`.  `connect`
//! resolves once the socket is open and the handshake packet(s) are sent,
//! bounded by a 10-second deadline.  A session never reconnects itself;
//! on any error or close it parks in `Closed` and notifies its pool; the
//! next poll cycle may re-select the broadcast.
//!
//! # Event delivery
//! Chat events land in a bounded ring buffer; when full the oldest is
//! dropped and a counter incremented (lossy is acceptable for chat
//! volume).  Donations and subscriptions are never dropped; they go out
//! through the orchestrator channel with backpressure.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use sc_model::{
    ActorRole, BroadcastKey, ChannelEvent, ChatStats, LiveBroadcast, Platform, SessionEvent,
    Viewer,
};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

/// Deadline for socket open + handshake send.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Chat events buffered per session before drop-oldest kicks in.
const CHAT_BUFFER_CAP: usize = 1024;
/// SOOP keepalive cadence.
const SOOP_PING_INTERVAL: Duration = Duration::from_secs(60);
/// CHZZK application-level keepalive cadence.
const CHZZK_PING_INTERVAL: Duration = Duration::from_secs(20);
/// Gap between the SOOP CONNECT and JOIN packets.
const SOOP_JOIN_DELAY: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Errors / state
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("WS: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connect timed out")]
    ConnectTimeout,
    #[error("invalid connect target: {0}")]
    InvalidTarget(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Connected,
    Closing,
    Closed,
}

// ---------------------------------------------------------------------------
// Connect targets
// ---------------------------------------------------------------------------

/// Platform-specific chat endpoint for one broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireTarget {
    Soop {
        ws_url: String,
        chat_room_id: String,
    },
    Chzzk {
        ws_url: String,
        chat_channel_id: String,
    },
}

/// A selector output row: the broadcast plus, for not-yet-connected
/// broadcasts, its chat endpoint.  `wire` is None when a session for this
/// key is already in the pool (no coordinate refetch needed).
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub broadcast: LiveBroadcast,
    pub wire: Option<WireTarget>,
}

// ---------------------------------------------------------------------------
// Shared session state
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ChatCounters {
    message_count: u64,
    chatters: HashSet<String>,
}

struct SessionShared {
    state: Mutex<ConnectionState>,
    viewers: Mutex<HashMap<String, Viewer>>,
    counters: Mutex<ChatCounters>,
    chat_buffer: Mutex<VecDeque<SessionEvent>>,
    dropped_chat_events: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// ChatSession (the owner-facing handle)
// ---------------------------------------------------------------------------

/// Handle to one live chat session.  The read loop runs in its own task;
/// all accessors copy values out under a session-scoped lock and never
/// block on session I/O.
pub struct ChatSession {
    broadcast: LiveBroadcast,
    shared: Arc<SessionShared>,
    shutdown: watch::Sender<bool>,
}

impl ChatSession {
    /// Open the socket, send the platform handshake, and spawn the read
    /// loop.  Rejects after [`CONNECT_TIMEOUT`].
    pub async fn connect(
        target: &ConnectTarget,
        outbound_tx: mpsc::Sender<SessionEvent>,
        closed_tx: mpsc::UnboundedSender<BroadcastKey>,
    ) -> Result<ChatSession, SessionError> {
        let wire = target.wire.clone().ok_or_else(|| {
            SessionError::InvalidTarget(format!("no chat endpoint for {}", target.broadcast.key))
        })?;

        let shared = Arc::new(SessionShared {
            state: Mutex::new(ConnectionState::Connecting),
            viewers: Mutex::new(HashMap::new()),
            counters: Mutex::new(ChatCounters::default()),
            chat_buffer: Mutex::new(VecDeque::new()),
            dropped_chat_events: AtomicU64::new(0),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let broadcast = target.broadcast.clone();

        match wire {
            WireTarget::Soop {
                ws_url,
                chat_room_id,
            } => {
                let mut request = ws_url
                    .as_str()
                    .into_client_request()
                    .map_err(|e| SessionError::InvalidTarget(format!("{ws_url}: {e}")))?;
                request
                    .headers_mut()
                    .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("chat"));

                let mut ws = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    tokio_tungstenite::connect_async(request),
                )
                .await
                .map_err(|_| SessionError::ConnectTimeout)?
                .map(|(ws, _response)| ws)?;

                ws.send(Message::Binary(soop_chat::build_connect().into()))
                    .await?;
                *lock(&shared.state) = ConnectionState::Handshaking;

                let loop_shared = shared.clone();
                let loop_broadcast = broadcast.clone();
                tokio::spawn(async move {
                    run_soop_loop(
                        ws,
                        &chat_room_id,
                        &loop_broadcast,
                        &loop_shared,
                        shutdown_rx,
                        outbound_tx,
                    )
                    .await;
                    finish(&loop_shared, &loop_broadcast.key, &closed_tx);
                });
            }
            WireTarget::Chzzk {
                ws_url,
                chat_channel_id,
            } => {
                let request = ws_url
                    .as_str()
                    .into_client_request()
                    .map_err(|e| SessionError::InvalidTarget(format!("{ws_url}: {e}")))?;

                let mut ws = tokio::time::timeout(
                    CONNECT_TIMEOUT,
                    tokio_tungstenite::connect_async(request),
                )
                .await
                .map_err(|_| SessionError::ConnectTimeout)?
                .map(|(ws, _response)| ws)?;

                let connect_frame = chzzk_chat::build_connect(&chat_channel_id);
                ws.send(Message::Text(connect_frame.into())).await?;
                *lock(&shared.state) = ConnectionState::Handshaking;

                let loop_shared = shared.clone();
                let loop_broadcast = broadcast.clone();
                tokio::spawn(async move {
                    run_chzzk_loop(ws, &loop_broadcast, &loop_shared, shutdown_rx, outbound_tx)
                        .await;
                    finish(&loop_shared, &loop_broadcast.key, &closed_tx);
                });
            }
        }

        Ok(ChatSession {
            broadcast,
            shared,
            shutdown: shutdown_tx,
        })
    }

    pub fn key(&self) -> &BroadcastKey {
        &self.broadcast.key
    }

    pub fn broadcast(&self) -> &LiveBroadcast {
        &self.broadcast
    }

    pub fn state(&self) -> ConnectionState {
        *lock(&self.shared.state)
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Copy of the rolling viewer map; cheap read, no reset.
    pub fn snapshot_viewers(&self) -> Vec<Viewer> {
        lock(&self.shared.viewers).values().cloned().collect()
    }

    /// Atomically read and zero the chat counters.
    ///
    /// The whole counter struct is swapped out under the lock, so a chat
    /// frame arriving concurrently lands entirely in the old struct
    /// (returned here) or the new one (counted next drain), never lost,
    /// never double-counted.
    pub fn drain_chat_stats(&self) -> ChatStats {
        let drained = std::mem::take(&mut *lock(&self.shared.counters));
        ChatStats {
            message_count: drained.message_count,
            unique_chatters: drained.chatters.len() as u64,
        }
    }

    /// Drain the buffered chat events for persistence.
    pub fn drain_chat_events(&self) -> Vec<SessionEvent> {
        lock(&self.shared.chat_buffer).drain(..).collect()
    }

    /// Chat events discarded by the drop-oldest policy since connect.
    pub fn dropped_chat_events(&self) -> u64 {
        self.shared.dropped_chat_events.load(Ordering::Relaxed)
    }

    /// Ask the read loop to stop; idempotent.  The ping timer dies with
    /// the loop and the viewer map is cleared on exit.
    pub fn close(&self) {
        {
            let mut state = lock(&self.shared.state);
            if *state == ConnectionState::Closed {
                return;
            }
            *state = ConnectionState::Closing;
        }
        let _ = self.shutdown.send(true);
    }
}

/// Loop epilogue: mark closed, clear the viewer map, notify the pool.
fn finish(
    shared: &SessionShared,
    key: &BroadcastKey,
    closed_tx: &mpsc::UnboundedSender<BroadcastKey>,
) {
    *lock(&shared.state) = ConnectionState::Closed;
    lock(&shared.viewers).clear();
    let _ = closed_tx.send(key.clone());
}

// ---------------------------------------------------------------------------
// SOOP read loop
// ---------------------------------------------------------------------------

/// Drive one SOOP session: delayed JOIN, 60 s pings, frame decoding.
///
/// Generic over the socket so tests can wire in a mock server stream.
async fn run_soop_loop<S>(
    mut ws: S,
    chat_room_id: &str,
    broadcast: &LiveBroadcast,
    shared: &SessionShared,
    mut shutdown: watch::Receiver<bool>,
    outbound_tx: mpsc::Sender<SessionEvent>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let mut ping = tokio::time::interval(SOOP_PING_INTERVAL);
    ping.tick().await;
    let join_delay = tokio::time::sleep(SOOP_JOIN_DELAY);
    tokio::pin!(join_delay);
    let mut join_sent = false;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped handle counts as a close request.
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
            }
            () = &mut join_delay, if !join_sent => {
                join_sent = true;
                if ws
                    .send(Message::Binary(soop_chat::build_join(chat_room_id).into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            _ = ping.tick(), if join_sent => {
                if ws
                    .send(Message::Binary(soop_chat::build_ping().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = ws.next() => {
                match msg {
                    None => break,
                    Some(Err(error)) => {
                        warn!(broadcast = %broadcast.key, %error, "SOOP socket error");
                        break;
                    }
                    Some(Ok(Message::Binary(data))) => {
                        if let Some(reply) =
                            handle_soop_frame(&data, broadcast, shared, &outbound_tx).await
                        {
                            if ws.send(Message::Binary(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Decode one SOOP frame and apply it; returns an optional reply packet.
async fn handle_soop_frame(
    data: &[u8],
    broadcast: &LiveBroadcast,
    shared: &SessionShared,
    outbound_tx: &mpsc::Sender<SessionEvent>,
) -> Option<Vec<u8>> {
    let frame = match soop_chat::parse_frame(data) {
        Ok(frame) => frame,
        Err(reason) => {
            debug!(broadcast = %broadcast.key, reason, "unparseable SOOP frame dropped");
            return None;
        }
    };
    match soop_chat::decode(&frame) {
        soop_chat::Decoded::ReplyPing => Some(soop_chat::build_ping()),
        soop_chat::Decoded::HandshakeAck => {
            let mut state = lock(&shared.state);
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Connected;
            }
            None
        }
        soop_chat::Decoded::Event(event) => {
            apply_event(event, broadcast, shared, outbound_tx).await;
            None
        }
        soop_chat::Decoded::Skip => None,
    }
}

// ---------------------------------------------------------------------------
// CHZZK read loop
// ---------------------------------------------------------------------------

/// Drive one CHZZK session: 20 s unconditional PONGs, frame decoding.
async fn run_chzzk_loop<S>(
    mut ws: S,
    broadcast: &LiveBroadcast,
    shared: &SessionShared,
    mut shutdown: watch::Receiver<bool>,
    outbound_tx: mpsc::Sender<SessionEvent>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let mut ping = tokio::time::interval(CHZZK_PING_INTERVAL);
    ping.tick().await;

    loop {
        tokio::select! {
            biased;
            changed = shutdown.changed() => {
                // A dropped handle counts as a close request.
                if changed.is_err() || *shutdown.borrow() {
                    let _ = ws.send(Message::Close(None)).await;
                    break;
                }
            }
            _ = ping.tick() => {
                if ws
                    .send(Message::Text(chzzk_chat::build_pong().into()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            msg = ws.next() => {
                match msg {
                    None => break,
                    Some(Err(error)) => {
                        warn!(broadcast = %broadcast.key, %error, "CHZZK socket error");
                        break;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Some(reply) =
                            handle_chzzk_frame(&text, broadcast, shared, &outbound_tx).await
                        {
                            if ws.send(Message::Text(reply.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

/// Decode one CHZZK frame and apply it; returns an optional reply frame.
async fn handle_chzzk_frame(
    text: &str,
    broadcast: &LiveBroadcast,
    shared: &SessionShared,
    outbound_tx: &mpsc::Sender<SessionEvent>,
) -> Option<String> {
    match chzzk_chat::decode_frame(text) {
        chzzk_chat::Decoded::ReplyPong => Some(chzzk_chat::build_pong()),
        chzzk_chat::Decoded::HandshakeAck => {
            let mut state = lock(&shared.state);
            if *state == ConnectionState::Handshaking {
                *state = ConnectionState::Connected;
            }
            None
        }
        chzzk_chat::Decoded::Events(events) => {
            for event in events {
                apply_event(event, broadcast, shared, outbound_tx).await;
            }
            None
        }
        chzzk_chat::Decoded::Skip => None,
    }
}

// ---------------------------------------------------------------------------
// Shared event application
// ---------------------------------------------------------------------------

async fn apply_event(
    event: ChannelEvent,
    broadcast: &LiveBroadcast,
    shared: &SessionShared,
    outbound_tx: &mpsc::Sender<SessionEvent>,
) {
    match event {
        ChannelEvent::UserListSnapshot(viewers) => {
            let mut map = lock(&shared.viewers);
            map.clear();
            for viewer in viewers {
                map.insert(viewer.user_id.clone(), viewer);
            }
        }
        ChannelEvent::UserJoin(viewer) => {
            lock(&shared.viewers).insert(viewer.user_id.clone(), viewer);
        }
        ChannelEvent::Chat(mut chat) => {
            if chat.user_id == broadcast.streamer_id {
                chat.role = ActorRole::Streamer;
            }
            {
                let mut counters = lock(&shared.counters);
                counters.message_count += 1;
                counters.chatters.insert(chat.user_id.clone());
            }
            // CHZZK has no user-list broadcast; the viewer map accumulates
            // from chat activity instead.
            if broadcast.key.platform == Platform::Chzzk {
                lock(&shared.viewers)
                    .entry(chat.user_id.clone())
                    .or_insert_with(|| chzzk_chat::viewer_from_chat(&chat));
            }
            buffer_chat(shared, session_event(broadcast, ChannelEvent::Chat(chat)));
        }
        donation @ (ChannelEvent::Donation(_) | ChannelEvent::Subscription(_)) => {
            // Never dropped: block on channel capacity rather than lose it.
            if outbound_tx
                .send(session_event(broadcast, donation))
                .await
                .is_err()
            {
                warn!(broadcast = %broadcast.key, "orchestrator channel closed, donation lost");
            }
        }
    }
}

fn session_event(broadcast: &LiveBroadcast, event: ChannelEvent) -> SessionEvent {
    SessionEvent {
        broadcast: broadcast.key.clone(),
        streamer_id: broadcast.streamer_id.clone(),
        at: Utc::now(),
        event,
    }
}

fn buffer_chat(shared: &SessionShared, event: SessionEvent) {
    let mut buffer = lock(&shared.chat_buffer);
    if buffer.len() >= CHAT_BUFFER_CAP {
        buffer.pop_front();
        shared.dropped_chat_events.fetch_add(1, Ordering::Relaxed);
    }
    buffer.push_back(event);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_broadcast(platform: Platform) -> LiveBroadcast {
        LiveBroadcast {
            key: BroadcastKey {
                platform,
                channel_id: "ch1".to_owned(),
                broadcast_no: "42".to_owned(),
            },
            streamer_id: "host1".to_owned(),
            streamer_nick: "Host".to_owned(),
            title: "t".to_owned(),
            category_id: None,
            category_name: None,
            tags: vec![],
            thumbnail: None,
            viewers: 10,
            started_at: None,
        }
    }

    fn fresh_shared() -> SessionShared {
        SessionShared {
            state: Mutex::new(ConnectionState::Connected),
            viewers: Mutex::new(HashMap::new()),
            counters: Mutex::new(ChatCounters::default()),
            chat_buffer: Mutex::new(VecDeque::new()),
            dropped_chat_events: AtomicU64::new(0),
        }
    }

    fn chat(user: &str, message: &str) -> ChannelEvent {
        ChannelEvent::Chat(sc_model::ChatMessage {
            user_id: user.to_owned(),
            nickname: user.to_owned(),
            role: ActorRole::Regular,
            message: message.to_owned(),
        })
    }

    #[tokio::test]
    async fn chat_counters_drain_to_zero() {
        let shared = fresh_shared();
        let broadcast = sample_broadcast(Platform::Soop);
        let (tx, _rx) = mpsc::channel(8);
        for i in 0..5 {
            apply_event(chat("u1", &format!("m{i}")), &broadcast, &shared, &tx).await;
        }
        apply_event(chat("u2", "hello"), &broadcast, &shared, &tx).await;

        let drained = std::mem::take(&mut *lock(&shared.counters));
        assert_eq!(drained.message_count, 6);
        assert_eq!(drained.chatters.len(), 2);
        let after = lock(&shared.counters);
        assert_eq!(after.message_count, 0);
        assert!(after.chatters.is_empty());
    }

    #[tokio::test]
    async fn user_list_replaces_and_join_updates() {
        let shared = fresh_shared();
        let broadcast = sample_broadcast(Platform::Soop);
        let (tx, _rx) = mpsc::channel(8);
        let viewer = |id: &str| Viewer {
            user_id: id.to_owned(),
            nickname: id.to_owned(),
            is_subscriber: false,
            is_fan: false,
        };
        apply_event(
            ChannelEvent::UserListSnapshot(vec![viewer("a"), viewer("b")]),
            &broadcast,
            &shared,
            &tx,
        )
        .await;
        assert_eq!(lock(&shared.viewers).len(), 2);

        apply_event(ChannelEvent::UserJoin(viewer("c")), &broadcast, &shared, &tx).await;
        assert_eq!(lock(&shared.viewers).len(), 3);

        // Replacement drops viewers absent from the new list.
        apply_event(
            ChannelEvent::UserListSnapshot(vec![viewer("c")]),
            &broadcast,
            &shared,
            &tx,
        )
        .await;
        let map = lock(&shared.viewers);
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("c"));
    }

    #[tokio::test]
    async fn chzzk_viewer_map_accumulates_from_chat() {
        let shared = fresh_shared();
        let broadcast = sample_broadcast(Platform::Chzzk);
        let (tx, _rx) = mpsc::channel(8);
        apply_event(chat("u1", "hi"), &broadcast, &shared, &tx).await;
        apply_event(chat("u1", "again"), &broadcast, &shared, &tx).await;
        apply_event(chat("u2", "yo"), &broadcast, &shared, &tx).await;
        assert_eq!(lock(&shared.viewers).len(), 2);
    }

    #[tokio::test]
    async fn streamer_chat_gets_streamer_role() {
        let shared = fresh_shared();
        let broadcast = sample_broadcast(Platform::Soop);
        let (tx, _rx) = mpsc::channel(8);
        apply_event(chat("host1", "welcome"), &broadcast, &shared, &tx).await;
        let buffered = lock(&shared.chat_buffer);
        let ChannelEvent::Chat(chat) = &buffered[0].event else {
            panic!("expected chat");
        };
        assert_eq!(chat.role, ActorRole::Streamer);
    }

    #[tokio::test]
    async fn chat_buffer_drops_oldest_when_full() {
        let shared = fresh_shared();
        let broadcast = sample_broadcast(Platform::Soop);
        let (tx, _rx) = mpsc::channel(8);
        for i in 0..(CHAT_BUFFER_CAP + 3) {
            apply_event(chat("u", &format!("m{i}")), &broadcast, &shared, &tx).await;
        }
        assert_eq!(shared.dropped_chat_events.load(Ordering::Relaxed), 3);
        let buffer = lock(&shared.chat_buffer);
        assert_eq!(buffer.len(), CHAT_BUFFER_CAP);
        let ChannelEvent::Chat(first) = &buffer[0].event else {
            panic!("expected chat");
        };
        assert_eq!(first.message, "m3");
    }

    #[tokio::test]
    async fn donations_go_out_through_the_channel() {
        let shared = fresh_shared();
        let broadcast = sample_broadcast(Platform::Chzzk);
        let (tx, mut rx) = mpsc::channel(8);
        apply_event(
            ChannelEvent::Donation(sc_model::Donation {
                user_id: "u1".to_owned(),
                nickname: "Ann".to_owned(),
                kind: sc_model::DonationKind::Cheese,
                amount_krw: 1000,
                original_amount: 1000,
                currency: "KRW".to_owned(),
                message: None,
            }),
            &broadcast,
            &shared,
            &tx,
        )
        .await;
        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered.broadcast, broadcast.key);
        assert!(delivered.at <= Utc::now());
        assert!(matches!(delivered.event, ChannelEvent::Donation(_)));
        // Donations are not buffered with chat.
        assert!(lock(&shared.chat_buffer).is_empty());
    }
}
