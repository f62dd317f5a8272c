//! CHZZK chat wire codec.
//!
//! CHZZK chat frames are JSON text messages dispatched on an integer `cmd`
//! field.  The `profile` and `extras` fields inside chat/donation bodies
//! are JSON **encoded as strings** and need a second parse.
//!
//! # Handshake
//! On open the client sends the `cmd:100` connect envelope with the chat
//! channel id; the server answers `cmd:10100` (connected).  Keepalive is an
//! application-level PONG (`cmd:10000`) sent unconditionally every 20 s,
//! and also in direct reply to a server `cmd:0` ping.
//!
//! Malformed bodies decode to nothing; a bad record is skipped, never
//! fatal to the session.

use sc_model::{
    ActorRole, ChannelEvent, ChatMessage, Donation, DonationKind, Subscription, Viewer,
};
use serde_json::{Value, json};

// ---------------------------------------------------------------------------
// Command codes
// ---------------------------------------------------------------------------

/// Integer `cmd` codes in the CHZZK chat protocol.
pub mod cmd {
    pub const PING: i64 = 0;
    pub const CONNECT: i64 = 100;
    pub const PONG: i64 = 10000;
    pub const CONNECTED: i64 = 10100;
    pub const RECENT_CHAT: i64 = 15101;
    pub const CHAT: i64 = 93101;
    pub const DONATION: i64 = 93102;
    pub const SUBSCRIPTION: i64 = 93103;
}

/// Protocol version sent in every client frame.
const VER: &str = "3";

// ---------------------------------------------------------------------------
// Frame builders
// ---------------------------------------------------------------------------

/// The connect envelope sent immediately after the socket opens.
pub fn build_connect(chat_channel_id: &str) -> String {
    json!({
        "ver": VER,
        "cmd": cmd::CONNECT,
        "svcid": "game",
        "cid": chat_channel_id,
        "bdy": {
            "devType": 2001,
            "auth": "READ",
            "uid": Value::Null,
            "accTkn": Value::Null,
        },
        "tid": 1,
    })
    .to_string()
}

/// Application-level keepalive, also the reply to a server ping.
pub fn build_pong() -> String {
    json!({ "ver": VER, "cmd": cmd::PONG }).to_string()
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Outcome of decoding one text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Server ping — the session must answer with [`build_pong`].
    ReplyPong,
    /// `cmd:10100` — handshake is complete.
    HandshakeAck,
    /// Unified channel events (a chat body may carry several records).
    Events(Vec<ChannelEvent>),
    /// Unknown cmd or unparseable frame; counted and dropped by the caller.
    Skip,
}

/// Decode one WebSocket text frame.
pub fn decode_frame(text: &str) -> Decoded {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return Decoded::Skip;
    };
    let Some(command) = frame.get("cmd").and_then(Value::as_i64) else {
        return Decoded::Skip;
    };
    match command {
        cmd::PING => Decoded::ReplyPong,
        cmd::CONNECTED => Decoded::HandshakeAck,
        cmd::CHAT | cmd::RECENT_CHAT => {
            let events: Vec<ChannelEvent> = body_records(&frame)
                .iter()
                .filter_map(|record| decode_chat(record))
                .collect();
            if events.is_empty() {
                Decoded::Skip
            } else {
                Decoded::Events(events)
            }
        }
        cmd::DONATION => {
            let events: Vec<ChannelEvent> = body_records(&frame)
                .iter()
                .filter_map(|record| decode_donation(record))
                .collect();
            if events.is_empty() {
                Decoded::Skip
            } else {
                Decoded::Events(events)
            }
        }
        cmd::SUBSCRIPTION => {
            let events: Vec<ChannelEvent> = body_records(&frame)
                .iter()
                .filter_map(|record| decode_subscription(record))
                .collect();
            if events.is_empty() {
                Decoded::Skip
            } else {
                Decoded::Events(events)
            }
        }
        _ => Decoded::Skip,
    }
}

/// `bdy` is a list of records or a single object; normalize to a list.
fn body_records(frame: &Value) -> Vec<Value> {
    match frame.get("bdy") {
        Some(Value::Array(records)) => records.clone(),
        Some(object @ Value::Object(_)) => vec![object.clone()],
        _ => Vec::new(),
    }
}

/// Re-parse a field that is JSON encoded as a string.
///
/// Tolerates the field already being an object (observed on some recent
/// payload revisions).
fn nested_json(record: &Value, field: &str) -> Option<Value> {
    match record.get(field) {
        Some(Value::String(raw)) => serde_json::from_str(raw).ok(),
        Some(object @ Value::Object(_)) => Some(object.clone()),
        _ => None,
    }
}

fn profile_role(profile: &Value) -> ActorRole {
    match profile.get("userRoleCode").and_then(Value::as_str) {
        Some("streamer") => ActorRole::Streamer,
        Some("streaming_chat_manager" | "streaming_channel_manager") => ActorRole::Manager,
        _ => ActorRole::Regular,
    }
}

fn decode_chat(record: &Value) -> Option<ChannelEvent> {
    let profile = nested_json(record, "profile")?;
    let user_id = profile.get("userIdHash")?.as_str()?.to_owned();
    let nickname = profile
        .get("nickname")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let message = record.get("msg").and_then(Value::as_str)?.to_owned();
    Some(ChannelEvent::Chat(ChatMessage {
        user_id,
        nickname,
        role: profile_role(&profile),
        message,
    }))
}

fn decode_donation(record: &Value) -> Option<ChannelEvent> {
    let extras = nested_json(record, "extras")?;
    let pay_amount = extras.get("payAmount").and_then(Value::as_i64)?;
    let (user_id, nickname) = match nested_json(record, "profile") {
        Some(profile) => (
            profile
                .get("userIdHash")
                .and_then(Value::as_str)
                .unwrap_or("anonymous")
                .to_owned(),
            profile
                .get("nickname")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        ),
        // Anonymous cheese carries no profile.
        None => ("anonymous".to_owned(), "익명".to_owned()),
    };
    let message = extras
        .get("msg")
        .and_then(Value::as_str)
        .or_else(|| record.get("msg").and_then(Value::as_str))
        .map(str::to_owned);
    Some(ChannelEvent::Donation(Donation {
        user_id,
        nickname,
        kind: DonationKind::Cheese,
        amount_krw: pay_amount,
        original_amount: pay_amount,
        currency: "KRW".to_owned(),
        message,
    }))
}

fn decode_subscription(record: &Value) -> Option<ChannelEvent> {
    let extras = nested_json(record, "extras")?;
    let months = extras.get("month").and_then(Value::as_i64)?;
    let profile = nested_json(record, "profile")?;
    Some(ChannelEvent::Subscription(Subscription {
        user_id: profile.get("userIdHash")?.as_str()?.to_owned(),
        nickname: profile
            .get("nickname")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        months,
    }))
}

/// Viewer record derived from a chat sender.
///
/// CHZZK has no user-list broadcast; the session accumulates its viewer map
/// from chat activity instead, so the codec exposes the mapping here.
pub fn viewer_from_chat(chat: &ChatMessage) -> Viewer {
    Viewer {
        user_id: chat.user_id.clone(),
        nickname: chat.nickname.clone(),
        is_subscriber: false,
        is_fan: false,
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn chat_frame(command: i64, records: Value) -> String {
        json!({ "ver": "3", "cmd": command, "bdy": records }).to_string()
    }

    fn chat_record(user: &str, nick: &str, msg: &str) -> Value {
        let profile = json!({ "userIdHash": user, "nickname": nick }).to_string();
        json!({ "profile": profile, "msg": msg, "extras": "{}" })
    }

    #[test]
    fn connect_envelope_matches_contract() {
        let frame: Value = serde_json::from_str(&build_connect("ch-123")).unwrap();
        assert_eq!(frame["cmd"], 100);
        assert_eq!(frame["ver"], "3");
        assert_eq!(frame["svcid"], "game");
        assert_eq!(frame["cid"], "ch-123");
        assert_eq!(frame["bdy"]["devType"], 2001);
        assert_eq!(frame["bdy"]["auth"], "READ");
        assert_eq!(frame["tid"], 1);
    }

    #[test]
    fn server_ping_gets_pong_reply() {
        assert_eq!(decode_frame(r#"{"ver":"3","cmd":0}"#), Decoded::ReplyPong);
        let pong: Value = serde_json::from_str(&build_pong()).unwrap();
        assert_eq!(pong["cmd"], 10000);
        assert_eq!(pong["ver"], "3");
    }

    #[test]
    fn connected_is_handshake_ack() {
        assert_eq!(
            decode_frame(r#"{"ver":"3","cmd":10100,"bdy":{}}"#),
            Decoded::HandshakeAck
        );
    }

    #[test]
    fn chat_list_body_decodes_every_record() {
        let frame = chat_frame(
            cmd::CHAT,
            json!([chat_record("u1", "Ann", "hi"), chat_record("u2", "Ben", "yo")]),
        );
        let Decoded::Events(events) = decode_frame(&frame) else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 2);
        let ChannelEvent::Chat(first) = &events[0] else {
            panic!("expected chat");
        };
        assert_eq!(first.user_id, "u1");
        assert_eq!(first.message, "hi");
    }

    #[test]
    fn single_object_body_is_accepted() {
        let frame = chat_frame(cmd::RECENT_CHAT, chat_record("u3", "Cho", "hello"));
        let Decoded::Events(events) = decode_frame(&frame) else {
            panic!("expected events");
        };
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn streamer_role_is_mapped_from_profile() {
        let profile =
            json!({ "userIdHash": "u9", "nickname": "Host", "userRoleCode": "streamer" })
                .to_string();
        let frame = chat_frame(cmd::CHAT, json!([{ "profile": profile, "msg": "welcome" }]));
        let Decoded::Events(events) = decode_frame(&frame) else {
            panic!("expected events");
        };
        let ChannelEvent::Chat(chat) = &events[0] else {
            panic!("expected chat");
        };
        assert_eq!(chat.role, ActorRole::Streamer);
    }

    #[test]
    fn donation_reads_pay_amount_from_extras() {
        let profile = json!({ "userIdHash": "u4", "nickname": "Dia" }).to_string();
        let extras = json!({ "payAmount": 5000, "msg": "gg" }).to_string();
        let frame = chat_frame(cmd::DONATION, json!([{ "profile": profile, "extras": extras }]));
        let Decoded::Events(events) = decode_frame(&frame) else {
            panic!("expected events");
        };
        let ChannelEvent::Donation(d) = &events[0] else {
            panic!("expected donation");
        };
        assert_eq!(d.kind, DonationKind::Cheese);
        assert_eq!(d.amount_krw, 5000);
        assert_eq!(d.original_amount, 5000);
        assert_eq!(d.message.as_deref(), Some("gg"));
    }

    #[test]
    fn anonymous_donation_without_profile_is_kept() {
        let extras = json!({ "payAmount": 1000 }).to_string();
        let frame = chat_frame(
            cmd::DONATION,
            json!([{ "extras": extras, "msg": "from outer msg" }]),
        );
        let Decoded::Events(events) = decode_frame(&frame) else {
            panic!("expected events");
        };
        let ChannelEvent::Donation(d) = &events[0] else {
            panic!("expected donation");
        };
        assert_eq!(d.user_id, "anonymous");
        assert_eq!(d.message.as_deref(), Some("from outer msg"));
    }

    #[test]
    fn subscription_carries_month_count() {
        let profile = json!({ "userIdHash": "u5", "nickname": "Eun" }).to_string();
        let extras = json!({ "month": 12 }).to_string();
        let frame = chat_frame(
            cmd::SUBSCRIPTION,
            json!([{ "profile": profile, "extras": extras }]),
        );
        let Decoded::Events(events) = decode_frame(&frame) else {
            panic!("expected events");
        };
        let ChannelEvent::Subscription(s) = &events[0] else {
            panic!("expected subscription");
        };
        assert_eq!(s.user_id, "u5");
        assert_eq!(s.months, 12);
    }

    #[test]
    fn malformed_frames_skip() {
        assert_eq!(decode_frame("not json"), Decoded::Skip);
        assert_eq!(decode_frame(r#"{"ver":"3"}"#), Decoded::Skip);
        assert_eq!(decode_frame(r#"{"cmd":424242,"bdy":[]}"#), Decoded::Skip);
        // Chat record whose profile string is broken JSON.
        let frame = chat_frame(cmd::CHAT, json!([{ "profile": "{oops", "msg": "x" }]));
        assert_eq!(decode_frame(&frame), Decoded::Skip);
    }

    /// Golden transcript: connected ack, recent chat, live chat, ping,
    /// donation, subscription, in order.
    #[test]
    fn transcript_decodes_in_order() {
        let profile = json!({ "userIdHash": "u1", "nickname": "Ann" }).to_string();
        let transcript = vec![
            r#"{"ver":"3","cmd":10100,"bdy":{}}"#.to_owned(),
            chat_frame(cmd::RECENT_CHAT, json!([chat_record("u0", "Old", "earlier")])),
            chat_frame(cmd::CHAT, json!([chat_record("u1", "Ann", "now")])),
            r#"{"ver":"3","cmd":0}"#.to_owned(),
            chat_frame(
                cmd::DONATION,
                json!([{ "profile": profile.clone(), "extras": json!({"payAmount": 777}).to_string() }]),
            ),
            chat_frame(
                cmd::SUBSCRIPTION,
                json!([{ "profile": profile, "extras": json!({"month": 2}).to_string() }]),
            ),
        ];
        let decoded: Vec<Decoded> = transcript.iter().map(|t| decode_frame(t)).collect();

        assert_eq!(decoded[0], Decoded::HandshakeAck);
        match &decoded[1] {
            Decoded::Events(events) => assert_eq!(events.len(), 1),
            other => panic!("expected recent chat events, got {other:?}"),
        }
        match &decoded[2] {
            Decoded::Events(events) => match &events[0] {
                ChannelEvent::Chat(c) => assert_eq!(c.message, "now"),
                other => panic!("expected chat, got {other:?}"),
            },
            other => panic!("expected chat events, got {other:?}"),
        }
        assert_eq!(decoded[3], Decoded::ReplyPong);
        match &decoded[4] {
            Decoded::Events(events) => match &events[0] {
                ChannelEvent::Donation(d) => assert_eq!(d.amount_krw, 777),
                other => panic!("expected donation, got {other:?}"),
            },
            other => panic!("expected donation events, got {other:?}"),
        }
        match &decoded[5] {
            Decoded::Events(events) => match &events[0] {
                ChannelEvent::Subscription(s) => assert_eq!(s.months, 2),
                other => panic!("expected subscription, got {other:?}"),
            },
            other => panic!("expected subscription events, got {other:?}"),
        }
    }
}
