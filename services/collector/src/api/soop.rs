//! SOOP discovery API client.
//!
//! Two endpoints:
//! - `POST /api/main_broad_list_api.php` — the paginated live index,
//!   ordered by viewer count; response payload is `{ "broad": [...] }`.
//! - `POST /afreeca/player_live_api.php?bjid=<id>` — per-channel chat
//!   server coordinates; success is `CHANNEL.RESULT == 1`.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, REFERER, USER_AGENT as UA_HEADER};
use sc_model::{BroadcastKey, LiveBroadcast, Platform};
use serde_json::Value;
use tracing::{debug, warn};

use super::{PAGE_DELAY, REQUEST_TIMEOUT, USER_AGENT, flexible_i64, flexible_string, parse_kst};

/// Index pagination safety cap.
const MAX_PAGES: u32 = 20;

const DEFAULT_BASE: &str = "https://live.sooplive.co.kr";
const REFERER_URL: &str = "https://play.sooplive.co.kr/";

/// Chat server coordinates for one channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoopChatCoordinates {
    pub chat_no: String,
    pub domain: String,
    pub port: u16,
}

impl SoopChatCoordinates {
    /// WebSocket endpoint: the chat port is the advertised port + 1, and
    /// the path carries the streamer id.  Subprotocol is `chat`.
    pub fn ws_url(&self, streamer_id: &str) -> String {
        format!(
            "wss://{}:{}/Websocket/{}",
            self.domain,
            self.port + 1,
            streamer_id
        )
    }
}

pub struct SoopApi {
    http: reqwest::Client,
    base: String,
}

impl SoopApi {
    pub fn new() -> SoopApi {
        Self::with_base(DEFAULT_BASE)
    }

    /// Custom base URL, for tests pointed at a local server.
    pub fn with_base(base: &str) -> SoopApi {
        let mut headers = HeaderMap::new();
        headers.insert(UA_HEADER, HeaderValue::from_static(USER_AGENT));
        headers.insert(REFERER, HeaderValue::from_static(REFERER_URL));
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .default_headers(headers)
            .build()
            .expect("reqwest client construction is infallible with static options");
        SoopApi {
            http,
            base: base.trim_end_matches('/').to_owned(),
        }
    }

    /// Paginate the live index until an empty page, an error, or the page
    /// cap.  A page failure returns whatever was collected before it.
    pub async fn list_live_broadcasts(&self) -> Vec<LiveBroadcast> {
        let mut collected = Vec::new();
        for page in 1..=MAX_PAGES {
            match self.fetch_page(page).await {
                Ok(broadcasts) if broadcasts.is_empty() => break,
                Ok(broadcasts) => collected.extend(broadcasts),
                Err(error) => {
                    warn!(page, %error, "SOOP index page failed, returning partial list");
                    break;
                }
            }
            tokio::time::sleep(PAGE_DELAY).await;
        }
        debug!(count = collected.len(), "SOOP live index collected");
        collected
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<LiveBroadcast>, reqwest::Error> {
        let form = [
            ("selectType", "action"),
            ("selectValue", "all"),
            ("orderType", "view_cnt"),
            ("pageNo", &page.to_string()),
            ("lang", "ko_KR"),
        ];
        let payload: Value = self
            .http
            .post(format!("{}/api/main_broad_list_api.php", self.base))
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let Some(entries) = payload.get("broad").and_then(Value::as_array) else {
            return Ok(Vec::new());
        };
        Ok(entries.iter().filter_map(normalize_broadcast).collect())
    }

    /// Fetch chat coordinates for one streamer; None means the channel is
    /// skipped this cycle.
    pub async fn fetch_chat_coordinates(&self, streamer_id: &str) -> Option<SoopChatCoordinates> {
        let form = [("bid", streamer_id), ("type", "live")];
        let response = self
            .http
            .post(format!(
                "{}/afreeca/player_live_api.php?bjid={}",
                self.base, streamer_id
            ))
            .form(&form)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;
        let payload: Value = response.json().await.ok()?;
        let channel = payload.get("CHANNEL")?;
        if channel.get("RESULT").and_then(flexible_i64) != Some(1) {
            debug!(streamer_id, "SOOP channel not playable, skipping");
            return None;
        }
        Some(SoopChatCoordinates {
            chat_no: flexible_string(channel.get("CHATNO")?)?,
            domain: flexible_string(channel.get("CHDOMAIN")?)?,
            port: u16::try_from(flexible_i64(channel.get("CHPT")?)?).ok()?,
        })
    }
}

impl Default for SoopApi {
    fn default() -> Self {
        Self::new()
    }
}

/// Fold one raw index entry into the normalized record.  Entries with no
/// usable broadcast number or streamer id are dropped.
fn normalize_broadcast(raw: &Value) -> Option<LiveBroadcast> {
    let broadcast_no = raw
        .get("broad_no")
        .and_then(flexible_string)
        .or_else(|| raw.get("bno").and_then(flexible_string))?;
    let streamer_id = raw.get("user_id").and_then(flexible_string)?;
    let viewers = raw
        .get("total_view_cnt")
        .and_then(flexible_i64)
        .or_else(|| {
            let pc = raw.get("pc_view_cnt").and_then(flexible_i64)?;
            let mobile = raw.get("mobile_view_cnt").and_then(flexible_i64)?;
            Some(pc + mobile)
        })
        .unwrap_or(0);
    let tags = raw
        .get("hash_tags")
        .and_then(Value::as_array)
        .map(|list| list.iter().filter_map(flexible_string).collect())
        .unwrap_or_default();

    Some(LiveBroadcast {
        key: BroadcastKey {
            platform: Platform::Soop,
            channel_id: streamer_id.clone(),
            broadcast_no,
        },
        streamer_id,
        streamer_nick: raw
            .get("user_nick")
            .and_then(flexible_string)
            .unwrap_or_default(),
        title: raw
            .get("broad_title")
            .and_then(flexible_string)
            .unwrap_or_default(),
        category_id: raw.get("sub_category").and_then(flexible_string),
        category_name: raw.get("category_name").and_then(flexible_string),
        tags,
        thumbnail: None,
        viewers,
        started_at: raw
            .get("broad_start")
            .and_then(Value::as_str)
            .and_then(parse_kst),
    })
}
