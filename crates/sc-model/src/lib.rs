// sc-model: Shared data model for the streamscope collection suite.
//
// Platform-neutral types flow between the platform codecs, the chat
// sessions, the connection pools, and the warehouse writer.  Everything
// here is a plain value type; cross-component communication copies these
// records, never shares mutable state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// The broadcast platforms in scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Soop,
    Chzzk,
}

impl Platform {
    /// The canonical lower-case name persisted in warehouse rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Soop => "soop",
            Platform::Chzzk => "chzzk",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Broadcast identity
// ---------------------------------------------------------------------------

/// Identity of one live session within one platform.
///
/// `broadcast_no` is the platform's own broadcast identifier (SOOP `broad_no`,
/// CHZZK live id); `channel_id` identifies the broadcaster's channel.  The
/// pair is unique per platform and stable for the life of the broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BroadcastKey {
    pub platform: Platform,
    pub channel_id: String,
    pub broadcast_no: String,
}

impl std::fmt::Display for BroadcastKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.platform, self.channel_id, self.broadcast_no
        )
    }
}

/// A live broadcast as normalized from a platform's discovery index.
///
/// Raw index shapes are platform-specific; the API clients fold them into
/// this record at the client boundary so nothing downstream sees raw JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveBroadcast {
    pub key: BroadcastKey,
    /// Platform user id of the broadcaster.
    pub streamer_id: String,
    pub streamer_nick: String,
    pub title: String,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub thumbnail: Option<String>,
    pub viewers: i64,
    /// Platform-reported start time; None when the index omits or mangles it.
    pub started_at: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// Viewers
// ---------------------------------------------------------------------------

/// One entry in a session's rolling viewer map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewer {
    pub user_id: String,
    pub nickname: String,
    pub is_subscriber: bool,
    pub is_fan: bool,
}

// ---------------------------------------------------------------------------
// Actor roles
// ---------------------------------------------------------------------------

/// Role of the acting user within the channel the event occurred in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorRole {
    Streamer,
    Manager,
    Vip,
    Fan,
    Regular,
    System,
}

impl ActorRole {
    pub fn as_str(self) -> &'static str {
        match self {
            ActorRole::Streamer => "streamer",
            ActorRole::Manager => "manager",
            ActorRole::Vip => "vip",
            ActorRole::Fan => "fan",
            ActorRole::Regular => "regular",
            ActorRole::System => "system",
        }
    }
}

// ---------------------------------------------------------------------------
// Channel events (unified across both wire protocols)
// ---------------------------------------------------------------------------

/// A chat message decoded from either platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub user_id: String,
    pub nickname: String,
    pub role: ActorRole,
    pub message: String,
}

/// Monetary / subscription-like event subtypes, normalized across platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DonationKind {
    Balloon,
    AdBalloon,
    VideoBalloon,
    Cheese,
    Subscribe,
}

impl DonationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DonationKind::Balloon => "balloon",
            DonationKind::AdBalloon => "ad_balloon",
            DonationKind::VideoBalloon => "video_balloon",
            DonationKind::Cheese => "cheese",
            DonationKind::Subscribe => "subscribe",
        }
    }
}

/// A donation event.
///
/// `amount_krw` is always the normalized KRW value; `original_amount` keeps
/// the platform's raw figure (balloon count, raw pay amount).  The two are
/// never interchanged downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Donation {
    pub user_id: String,
    pub nickname: String,
    pub kind: DonationKind,
    pub amount_krw: i64,
    pub original_amount: i64,
    pub currency: String,
    pub message: Option<String>,
}

/// A channel subscription event.  Persisted as a donation of kind
/// `subscribe` with amount 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: String,
    pub nickname: String,
    pub months: i64,
}

/// The unified event model both protocol decoders emit.
///
/// Adjacently tagged so list-carrying variants serialize cleanly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "body", rename_all = "snake_case")]
pub enum ChannelEvent {
    Chat(ChatMessage),
    /// Full replacement of the session's viewer map.
    UserListSnapshot(Vec<Viewer>),
    /// Single viewer added or updated in place.
    UserJoin(Viewer),
    Donation(Donation),
    Subscription(Subscription),
}

/// A channel event stamped by the owning session on arrival.
///
/// `at` is the arrival wall-clock time; downstream `ingested_at` is stamped
/// at persist time, so `at <= ingested_at` holds for every event row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub broadcast: BroadcastKey,
    pub streamer_id: String,
    pub at: DateTime<Utc>,
    pub event: ChannelEvent,
}

// ---------------------------------------------------------------------------
// Chat-rate counters
// ---------------------------------------------------------------------------

/// Drained chat-rate counters for one snapshot window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatStats {
    pub message_count: u64,
    pub unique_chatters: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn platform_names_are_stable() {
        assert_eq!(Platform::Soop.as_str(), "soop");
        assert_eq!(Platform::Chzzk.as_str(), "chzzk");
        assert_eq!(
            serde_json::to_string(&Platform::Chzzk).unwrap(),
            "\"chzzk\""
        );
    }

    #[test]
    fn channel_event_round_trips_with_kind_tag() {
        let event = ChannelEvent::Donation(Donation {
            user_id: "u1".to_owned(),
            nickname: "nick".to_owned(),
            kind: DonationKind::AdBalloon,
            amount_krw: 500,
            original_amount: 5,
            currency: "KRW".to_owned(),
            message: Some("hi".to_owned()),
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"kind\":\"donation\""));
        let back: ChannelEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn broadcast_key_display_is_slash_joined() {
        let key = BroadcastKey {
            platform: Platform::Soop,
            channel_id: "streamer1".to_owned(),
            broadcast_no: "12345".to_owned(),
        };
        assert_eq!(key.to_string(), "soop/streamer1/12345");
    }
}
