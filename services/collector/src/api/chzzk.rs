//! CHZZK discovery API client.
//!
//! Two endpoints:
//! - `GET /service/v1/home/lives?size=50&offset=<n>` — live index pages at
//!   `content.streamingLiveList`.
//! - `GET /service/v3/channels/<channelId>/live-detail` — per-channel chat
//!   channel id; success is `code == 200`.

use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT as UA_HEADER};
use sc_model::{BroadcastKey, LiveBroadcast, Platform};
use serde_json::Value;
use tracing::{debug, warn};

use super::{PAGE_DELAY, REQUEST_TIMEOUT, USER_AGENT, flexible_i64, flexible_string, parse_kst};

/// Index pagination: 40 pages of 50.
const MAX_PAGES: u32 = 40;
const PAGE_SIZE: u32 = 50;

const DEFAULT_BASE: &str = "https://api.chzzk.naver.com";
const REFERER_URL: &str = "https://chzzk.naver.com/";
/// Chat servers are sharded kr-ss1..kr-ss5.
const CHAT_SHARDS: u32 = 5;
const CHAT_HOST: &str = "chat.naver.com";

/// Chat coordinates for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChzzkChatCoordinates {
    pub chat_channel_id: String,
}

impl ChzzkChatCoordinates {
    /// WebSocket endpoint; the shard is a stable function of the chat
    /// channel id so reconnects land on the same server.
    pub fn ws_url(&self) -> String {
        let shard = self
            .chat_channel_id
            .bytes()
            .fold(0_u32, |acc, b| acc.wrapping_add(u32::from(b)))
            % CHAT_SHARDS
            + 1;
        format!("wss://kr-ss{shard}.{CHAT_HOST}/chat")
    }
}

pub struct ChzzkApi {
    http: reqwest::Client,
    base: String,
}

impl ChzzkApi {
    pub fn new() -> ChzzkApi {
        Self::with_base(DEFAULT_BASE)
    }

    /// Custom base URL, for tests pointed at a local server.
    pub fn with_base(base: &str) -> ChzzkApi {
        let mut headers = HeaderMap::new();
        headers.insert(UA_HEADER, HeaderValue::from_static(USER_AGENT));
        headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .expect("reqwest client construction is infallible with static options");
        ChzzkApi {
            http,
            base: base.trim_end_matches('/').to_owned(),
        }
    }

    /// Paginate the live index until an empty page, an error, or the page
    /// cap.  A page failure returns whatever was collected before it.
    pub async fn list_live_broadcasts(&self) -> Vec<LiveBroadcast> {
        let mut collected = Vec::new();
        for page in 0..MAX_PAGES {
            match self.fetch_page(page).await {
                Ok(broadcasts) if broadcasts.is_empty() => break,
                Ok(broadcasts) => collected.extend(broadcasts),
                Err(error) => {
                    warn!(page, %error, "CHZZK index page failed, returning partial list");
                    break;
                }
            }
            tokio::time::sleep(PAGE_DELAY).await;
        }
        debug!(count = collected.len(), "CHZZK live index collected");
        collected
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<LiveBroadcast>, reqwest::Error> {
        let payload: Value = self
            .http
            .get(format!(
                "{}/service/v1/home/lives?size={}&offset={}",
                self.base,
                PAGE_SIZE,
                page * PAGE_SIZE
            ))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let Some(entries) = payload
            .pointer("/content/streamingLiveList")
            .and_then(Value::as_array)
        else {
            return Ok(Vec::new());
        };
        Ok(entries.iter().filter_map(normalize_broadcast).collect())
    }

    /// Fetch the chat channel id for one channel; None means the channel
    /// is skipped this cycle.
    pub async fn fetch_chat_coordinates(&self, channel_id: &str) -> Option<ChzzkChatCoordinates> {
        let response = self
            .http
            .get(format!(
                "{}/service/v3/channels/{}/live-detail",
                self.base, channel_id
            ))
            .send()
            .await
            .ok()?;
        let payload: Value = response.json().await.ok()?;
        if payload.get("code").and_then(Value::as_i64) != Some(200) {
            debug!(channel_id, "CHZZK live-detail unavailable, skipping");
            return None;
        }
        let chat_channel_id = payload
            .pointer("/content/chatChannelId")
            .and_then(flexible_string)?;
        Some(ChzzkChatCoordinates { chat_channel_id })
    }
}

impl Default for ChzzkApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold one raw index entry into the normalized record.
fn normalize_broadcast(raw: &Value) -> Option<LiveBroadcast> {
    let channel = raw.get("channel")?;
    let channel_id = channel.get("channelId").and_then(flexible_string)?;
    let live_id = raw.get("liveId").and_then(flexible_string)?;
    Some(LiveBroadcast {
        key: BroadcastKey {
            platform: Platform::Chzzk,
            channel_id: channel_id.clone(),
            broadcast_no: live_id,
        },
        streamer_id: channel_id,
        streamer_nick: channel
            .get("channelName")
            .and_then(flexible_string)
            .unwrap_or_default(),
        title: raw
            .get("liveTitle")
            .and_then(flexible_string)
            .unwrap_or_default(),
        category_id: raw.get("liveCategory").and_then(flexible_string),
        category_name: raw.get("liveCategoryValue").and_then(flexible_string),
        tags: raw
            .get("tags")
            .and_then(Value::as_array)
            .map(|list| list.iter().filter_map(flexible_string).collect())
            .unwrap_or_default(),
        thumbnail: raw.get("liveImageUrl").and_then(flexible_string),
        viewers: raw
            .get("concurrentUserCount")
            .and_then(flexible_i64)
            .unwrap_or(0),
        started_at: raw
            .get("openDate")
            .and_then(Value::as_str)
            .and_then(parse_kst),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn normalizes_a_typical_index_entry() {
        let raw = json!({
            "liveId": 987654,
            "liveTitle": "새벽 저챗",
            "concurrentUserCount": 4321,
            "liveCategory": "talk",
            "liveCategoryValue": "토크",
            "openDate": "2026-02-01 23:30:00",
            "liveImageUrl": "https://img.example.net/live/{type}.jpg",
            "tags": ["수다"],
            "channel": { "channelId": "abcdef0123456789", "channelName": "새벽지기" }
        });
        let broadcast = normalize_broadcast(&raw).unwrap();
        assert_eq!(broadcast.key.platform, Platform::Chzzk);
        assert_eq!(broadcast.key.channel_id, "abcdef0123456789");
        assert_eq!(broadcast.key.broadcast_no, "987654");
        assert_eq!(broadcast.streamer_id, "abcdef0123456789");
        assert_eq!(broadcast.viewers, 4321);
        assert_eq!(broadcast.category_id.as_deref(), Some("talk"));
        assert_eq!(
            broadcast.started_at.unwrap().to_rfc3339(),
            "2026-02-01T14:30:00+00:00"
        );
    }

    #[test]
    fn entries_without_channel_or_live_id_are_dropped() {
        assert!(normalize_broadcast(&json!({ "liveId": 1 })).is_none());
        assert!(
            normalize_broadcast(&json!({ "channel": { "channelId": "x" } })).is_none()
        );
    }

    #[test]
    fn chat_shard_is_stable_and_in_range() {
        let coords = ChzzkChatCoordinates {
            chat_channel_id: "chat-room-7".to_owned(),
        };
        let url = coords.ws_url();
        assert_eq!(url, coords.ws_url());
        let shard: u32 = url
            .strip_prefix("wss://kr-ss")
            .unwrap()
            .split('.')
            .next()
            .unwrap()
            .parse()
            .unwrap();
        assert!((1..=5).contains(&shard));
        assert!(url.ends_with(".chat.naver.com/chat"));
    }
}
