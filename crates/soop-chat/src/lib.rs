//! SOOP chat wire codec.
//!
//! The SOOP chat server speaks a text protocol framed in WebSocket binary
//! messages.  Every packet is:
//!
//! ```text
//! 0x1B 0x09 <code:4 ASCII digits> <len:6 ASCII digits> <payload:len bytes>
//! ```
//!
//! The payload is a run of fields, each preceded by the separator byte
//! `0x0C`, with a trailing separator.  Splitting the payload on `0x0C`
//! therefore always yields an empty element at index 0; field indices in
//! this module count from 1, matching that layout.
//!
//! # Handshake
//! On socket open the client sends a CONNECT packet (`0001`), then 500 ms
//! later a JOIN packet (`0002`) carrying the chat-room id (its UTF-8 byte
//! length is the 6-digit length header).  The server's first echo of either
//! code completes the handshake.  Keepalive is a bare PING packet (`0000`)
//! every 60 seconds; a server PING is answered with the same packet.
//!
//! The decoder never fails on a malformed record: unparseable packets and
//! bad tuples decode to [`Decoded::Skip`] and the session moves on.

use sc_model::{
    ActorRole, ChannelEvent, ChatMessage, Donation, DonationKind, Subscription, Viewer,
};

/// Field separator within a packet payload.
pub const SEPARATOR: u8 = 0x0C;

/// Two-byte packet prefix.
pub const PREFIX: [u8; 2] = [0x1B, 0x09];

// ---------------------------------------------------------------------------
// Action codes
// ---------------------------------------------------------------------------

/// Wire action codes relevant to collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Ping,
    Connect,
    Join,
    UserList,
    UserJoin,
    Chat,
    TextDonation,
    AdBalloon,
    VideoDonation,
    Subscribe,
    /// Any other code; carried so callers can log unknown traffic.
    Other(u16),
}

impl Action {
    pub fn code(self) -> u16 {
        match self {
            Action::Ping => 0,
            Action::Connect => 1,
            Action::Join => 2,
            Action::UserList => 4,
            Action::Chat => 5,
            Action::UserJoin => 12,
            Action::TextDonation => 18,
            Action::AdBalloon => 87,
            Action::VideoDonation => 105,
            Action::Subscribe => 93,
            Action::Other(code) => code,
        }
    }

    fn from_code(code: u16) -> Action {
        match code {
            0 => Action::Ping,
            1 => Action::Connect,
            2 => Action::Join,
            4 => Action::UserList,
            5 => Action::Chat,
            12 => Action::UserJoin,
            18 => Action::TextDonation,
            87 => Action::AdBalloon,
            105 => Action::VideoDonation,
            93 => Action::Subscribe,
            other => Action::Other(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Frame parsing
// ---------------------------------------------------------------------------

/// A parsed SOOP packet: action code plus separator-split payload fields.
///
/// `parts[0]` is always the empty leading element (see module docs).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoopFrame {
    pub action: Action,
    pub parts: Vec<String>,
}

/// Parse one WebSocket binary message into a [`SoopFrame`].
pub fn parse_frame(bytes: &[u8]) -> Result<SoopFrame, &'static str> {
    if bytes.len() < 12 {
        return Err("Packet too short");
    }
    if bytes[0..2] != PREFIX {
        return Err("Invalid packet prefix");
    }
    let code_str = std::str::from_utf8(&bytes[2..6]).map_err(|_| "Invalid action code")?;
    let code: u16 = code_str.parse().map_err(|_| "Invalid action code")?;
    let len_str = std::str::from_utf8(&bytes[6..12]).map_err(|_| "Invalid payload length")?;
    let len: usize = len_str.parse().map_err(|_| "Invalid payload length")?;
    if bytes.len() < 12 + len {
        return Err("Truncated payload");
    }
    let payload = std::str::from_utf8(&bytes[12..12 + len]).map_err(|_| "Invalid UTF-8")?;
    let parts: Vec<String> = payload.split(SEPARATOR as char).map(str::to_owned).collect();
    Ok(SoopFrame {
        action: Action::from_code(code),
        parts,
    })
}

/// Encode a packet from an action code and payload fields.
///
/// Each field is preceded by the separator and the payload carries a
/// trailing separator; a frame with no fields has an empty payload.
pub fn encode_frame(action: Action, fields: &[&str]) -> Vec<u8> {
    let mut payload: Vec<u8> = Vec::new();
    for field in fields {
        payload.push(SEPARATOR);
        payload.extend_from_slice(field.as_bytes());
    }
    if !fields.is_empty() {
        payload.push(SEPARATOR);
    }
    let mut packet = Vec::with_capacity(12 + payload.len());
    packet.extend_from_slice(&PREFIX);
    packet.extend_from_slice(format!("{:04}", action.code()).as_bytes());
    packet.extend_from_slice(format!("{:06}", payload.len()).as_bytes());
    packet.extend_from_slice(&payload);
    packet
}

/// The CONNECT packet sent immediately after the socket opens.
///
/// Carries an empty auth ticket (read-only access) and the public client
/// flag field.
pub fn build_connect() -> Vec<u8> {
    encode_frame(Action::Connect, &["", "", "16"])
}

/// The JOIN packet sent 500 ms after CONNECT, carrying the chat-room id.
pub fn build_join(chat_room_id: &str) -> Vec<u8> {
    encode_frame(Action::Join, &[chat_room_id])
}

/// Bare keepalive packet.  Sent every 60 s, and echoed back verbatim when
/// the server pings first.
pub fn build_ping() -> Vec<u8> {
    encode_frame(Action::Ping, &[])
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Outcome of decoding one parsed frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    /// Server ping — the session must answer with [`build_ping`].
    ReplyPing,
    /// Server echo of CONNECT/JOIN — handshake is complete.
    HandshakeAck,
    /// A unified channel event.
    Event(ChannelEvent),
    /// Unknown or malformed traffic; counted and dropped by the caller.
    Skip,
}

/// Decode a parsed frame into the unified event model.
///
/// Malformed tuples within a known action code decode to [`Decoded::Skip`];
/// this function never panics on wire data.
pub fn decode(frame: &SoopFrame) -> Decoded {
    match frame.action {
        Action::Ping => Decoded::ReplyPing,
        Action::Connect | Action::Join => Decoded::HandshakeAck,
        Action::UserList => Decoded::Event(ChannelEvent::UserListSnapshot(parse_viewer_tuples(
            &frame.parts,
        ))),
        Action::UserJoin => match parse_viewer_tuples(&frame.parts).into_iter().next() {
            Some(viewer) => Decoded::Event(ChannelEvent::UserJoin(viewer)),
            None => Decoded::Skip,
        },
        Action::Chat => decode_chat(&frame.parts),
        Action::TextDonation => decode_balloon(&frame.parts, DonationKind::Balloon),
        Action::AdBalloon => decode_balloon(&frame.parts, DonationKind::AdBalloon),
        Action::VideoDonation => decode_balloon(&frame.parts, DonationKind::VideoBalloon),
        Action::Subscribe => decode_subscribe(&frame.parts),
        Action::Other(_) => Decoded::Skip,
    }
}

/// Iterate `(raw_id, nickname, flags)` 3-tuples starting at field 1.
///
/// Raw ids carry a trailing `(n)` device suffix which is stripped; tuples
/// with an empty id are dropped (the trailing separator produces one).
fn parse_viewer_tuples(parts: &[String]) -> Vec<Viewer> {
    let mut viewers = Vec::new();
    let mut i = 1;
    while i + 2 < parts.len() {
        let raw_id = parts[i].as_str();
        if raw_id.is_empty() {
            i += 3;
            continue;
        }
        let (is_subscriber, is_fan) = parse_flags(&parts[i + 2]);
        viewers.push(Viewer {
            user_id: strip_device_suffix(raw_id).to_owned(),
            nickname: parts[i + 1].clone(),
            is_subscriber,
            is_fan,
        });
        i += 3;
    }
    viewers
}

/// Strip the trailing `(n)` connection-count suffix from a raw user id.
fn strip_device_suffix(raw_id: &str) -> &str {
    match (raw_id.rfind('('), raw_id.ends_with(')')) {
        (Some(open), true) => &raw_id[..open],
        _ => raw_id,
    }
}

/// Flags are two pipe-separated 32-bit ints.
///
/// `flag1 & 0x1000_0000` marks a subscriber; a nonzero
/// `(flag1 & 0x2000_0000) | (flag2 & 0x4_0000)` marks a fan.
fn parse_flags(flags: &str) -> (bool, bool) {
    let mut split = flags.splitn(2, '|');
    let flag1: u32 = split.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let flag2: u32 = split.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let is_subscriber = flag1 & 0x1000_0000 != 0;
    let is_fan = (flag1 & 0x2000_0000) | (flag2 & 0x4_0000) != 0;
    (is_subscriber, is_fan)
}

/// Chat layout: field 1 = message, 2 = raw sender id, 6 = nickname,
/// 7 = sender flags (optional).
fn decode_chat(parts: &[String]) -> Decoded {
    if parts.len() < 3 || parts[2].is_empty() {
        return Decoded::Skip;
    }
    let user_id = strip_device_suffix(&parts[2]).to_owned();
    let nickname = parts.get(6).cloned().unwrap_or_default();
    let is_fan = parts.get(7).is_some_and(|flags| parse_flags(flags).1);
    let role = if is_fan {
        ActorRole::Fan
    } else {
        ActorRole::Regular
    };
    Decoded::Event(ChannelEvent::Chat(ChatMessage {
        user_id,
        nickname,
        role,
        message: parts[1].clone(),
    }))
}

/// Balloon layout: field 1 = target channel id, 2 = sender id, 3 = sender
/// nickname, 4 = balloon count.  1 balloon = 100 KRW for every subtype.
fn decode_balloon(parts: &[String], kind: DonationKind) -> Decoded {
    if parts.len() < 5 {
        return Decoded::Skip;
    }
    let mut count: i64 = parts[4].trim().parse().unwrap_or(-1);
    if count < 0 {
        return Decoded::Skip;
    }
    if count == 0 && kind == DonationKind::AdBalloon {
        // TODO(wire): ad-balloon frames sometimes carry 0 in the count field
        // with the real count further along; whether this is genuine server
        // behavior or a historical parsing artifact is unresolved.  Behavior
        // preserved pending a captured transcript that settles it.
        count = scan_fallback_count(&parts[5..parts.len().min(10)]);
    }
    if count == 0 {
        return Decoded::Skip;
    }
    Decoded::Event(ChannelEvent::Donation(Donation {
        user_id: strip_device_suffix(&parts[2]).to_owned(),
        nickname: parts[3].clone(),
        kind,
        amount_krw: count * 100,
        original_amount: count,
        currency: "KRW".to_owned(),
        message: None,
    }))
}

/// First plausible count (0 < n < 100 000) among the given fields, else 0.
fn scan_fallback_count(parts: &[String]) -> i64 {
    parts
        .iter()
        .filter_map(|p| p.trim().parse::<i64>().ok())
        .find(|&n| n > 0 && n < 100_000)
        .unwrap_or(0)
}

/// Subscribe layout: field 1 = user id, 2 = nickname, 3 = months.
fn decode_subscribe(parts: &[String]) -> Decoded {
    if parts.len() < 4 || parts[1].is_empty() {
        return Decoded::Skip;
    }
    let months: i64 = match parts[3].trim().parse() {
        Ok(m) => m,
        Err(_) => return Decoded::Skip,
    };
    Decoded::Event(ChannelEvent::Subscription(Subscription {
        user_id: strip_device_suffix(&parts[1]).to_owned(),
        nickname: parts[2].clone(),
        months,
    }))
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(action: Action, fields: &[&str]) -> SoopFrame {
        parse_frame(&encode_frame(action, fields)).expect("self-encoded frame parses")
    }

    #[test]
    fn encode_then_parse_preserves_fields() {
        let packet = encode_frame(Action::Chat, &["", "hello", "user1(2)"]);
        assert_eq!(&packet[0..2], &PREFIX);
        assert_eq!(&packet[2..6], b"0005");
        let parsed = parse_frame(&packet).unwrap();
        assert_eq!(parsed.action, Action::Chat);
        // Leading empty element + 3 fields + trailing empty element.
        assert_eq!(parsed.parts.len(), 5);
        assert_eq!(parsed.parts[2], "hello");
    }

    #[test]
    fn length_header_is_utf8_byte_length() {
        let room = "한국어방";
        let packet = build_join(room);
        let len: usize = std::str::from_utf8(&packet[6..12]).unwrap().parse().unwrap();
        // separator + room id bytes + trailing separator
        assert_eq!(len, room.len() + 2);
        assert_eq!(format!("{:06}", len).as_bytes(), &packet[6..12]);
    }

    #[test]
    fn rejects_bad_prefix_and_truncation() {
        assert_eq!(parse_frame(b"\x1b\x08000000000"), Err("Packet too short"));
        let mut packet = encode_frame(Action::Ping, &[]);
        packet[0] = 0x1C;
        assert_eq!(parse_frame(&packet), Err("Invalid packet prefix"));
        let mut packet = encode_frame(Action::Chat, &["", "msg", "uid"]);
        packet.truncate(packet.len() - 1);
        assert_eq!(parse_frame(&packet), Err("Truncated payload"));
    }

    #[test]
    fn ping_decodes_to_reply() {
        let parsed = parse_frame(&build_ping()).unwrap();
        assert_eq!(decode(&parsed), Decoded::ReplyPing);
    }

    #[test]
    fn connect_and_join_echo_are_handshake_acks() {
        assert_eq!(decode(&frame(Action::Connect, &[])), Decoded::HandshakeAck);
        assert_eq!(decode(&frame(Action::Join, &["room9"])), Decoded::HandshakeAck);
    }

    #[test]
    fn user_list_parses_tuples_and_flags() {
        // 268435456 = 0x10000000 (subscriber), 536870912 = 0x20000000 (fan via flag1)
        let f = frame(
            Action::UserList,
            &[
                "alice(1)", "Alice", "268435456|0",
                "bob", "Bob", "536870912|0",
                "carol(3)", "Carol", "0|262144",
            ],
        );
        let Decoded::Event(ChannelEvent::UserListSnapshot(viewers)) = decode(&f) else {
            panic!("expected user list");
        };
        assert_eq!(viewers.len(), 3);
        assert_eq!(viewers[0].user_id, "alice");
        assert!(viewers[0].is_subscriber);
        assert!(!viewers[0].is_fan);
        assert!(viewers[1].is_fan);
        assert!(!viewers[1].is_subscriber);
        // 262144 = 0x40000: fan via flag2
        assert_eq!(viewers[2].user_id, "carol");
        assert!(viewers[2].is_fan);
    }

    #[test]
    fn user_join_takes_first_tuple() {
        let f = frame(Action::UserJoin, &["dave(2)", "Dave", "0|0"]);
        let Decoded::Event(ChannelEvent::UserJoin(viewer)) = decode(&f) else {
            panic!("expected join");
        };
        assert_eq!(viewer.user_id, "dave");
        assert!(!viewer.is_subscriber && !viewer.is_fan);
    }

    #[test]
    fn chat_decodes_message_and_sender() {
        let f = frame(
            Action::Chat,
            &["hello world", "erin(1)", "", "", "", "Erin", "0|262144"],
        );
        let Decoded::Event(ChannelEvent::Chat(chat)) = decode(&f) else {
            panic!("expected chat");
        };
        assert_eq!(chat.message, "hello world");
        assert_eq!(chat.user_id, "erin");
        assert_eq!(chat.nickname, "Erin");
        assert_eq!(chat.role, ActorRole::Fan);
    }

    #[test]
    fn text_donation_converts_count_to_krw() {
        let f = frame(Action::TextDonation, &["streamer1", "fan9", "Fan Nine", "50"]);
        let Decoded::Event(ChannelEvent::Donation(d)) = decode(&f) else {
            panic!("expected donation");
        };
        assert_eq!(d.kind, DonationKind::Balloon);
        assert_eq!(d.original_amount, 50);
        assert_eq!(d.amount_krw, 5000);
        assert_eq!(d.currency, "KRW");
    }

    #[test]
    fn ad_balloon_zero_count_scans_later_fields() {
        let f = frame(
            Action::AdBalloon,
            &["streamer1", "fan9", "Fan Nine", "0", "", "0", "250", "999999"],
        );
        let Decoded::Event(ChannelEvent::Donation(d)) = decode(&f) else {
            panic!("expected donation");
        };
        assert_eq!(d.kind, DonationKind::AdBalloon);
        assert_eq!(d.original_amount, 250);
        assert_eq!(d.amount_krw, 25_000);
    }

    #[test]
    fn ad_balloon_scan_rejects_out_of_range_values() {
        // 100000 is out of plausible range, so no count is found and the
        // frame is skipped rather than invented.
        let f = frame(
            Action::AdBalloon,
            &["streamer1", "fan9", "Fan Nine", "0", "100000", "0"],
        );
        assert_eq!(decode(&f), Decoded::Skip);
    }

    #[test]
    fn text_donation_zero_count_does_not_scan() {
        let f = frame(
            Action::TextDonation,
            &["streamer1", "fan9", "Fan Nine", "0", "250"],
        );
        assert_eq!(decode(&f), Decoded::Skip);
    }

    #[test]
    fn video_donation_uses_video_subtype() {
        let f = frame(Action::VideoDonation, &["streamer1", "fan9", "Fan Nine", "3"]);
        let Decoded::Event(ChannelEvent::Donation(d)) = decode(&f) else {
            panic!("expected donation");
        };
        assert_eq!(d.kind, DonationKind::VideoBalloon);
        assert_eq!(d.amount_krw, 300);
    }

    #[test]
    fn subscribe_carries_months_and_no_amount() {
        let f = frame(Action::Subscribe, &["fan9(1)", "Fan Nine", "7"]);
        let Decoded::Event(ChannelEvent::Subscription(s)) = decode(&f) else {
            panic!("expected subscription");
        };
        assert_eq!(s.user_id, "fan9");
        assert_eq!(s.months, 7);
    }

    #[test]
    fn malformed_known_frames_skip_not_panic() {
        assert_eq!(decode(&frame(Action::Chat, &[])), Decoded::Skip);
        assert_eq!(
            decode(&frame(Action::Subscribe, &["fan9", "Fan", "soon"])),
            Decoded::Skip
        );
        assert_eq!(decode(&frame(Action::Other(42), &["x"])), Decoded::Skip);
        assert_eq!(
            decode(&frame(Action::TextDonation, &["s", "u", "n", "NaN"])),
            Decoded::Skip
        );
    }

    #[test]
    fn device_suffix_strip_is_conservative() {
        assert_eq!(strip_device_suffix("user(12)"), "user");
        assert_eq!(strip_device_suffix("user"), "user");
        assert_eq!(strip_device_suffix("us(er"), "us(er");
        assert_eq!(strip_device_suffix("(1)"), "");
    }

    /// Golden transcript: a recorded sequence of frames decodes to the
    /// expected unified event sequence in order.
    #[test]
    fn transcript_decodes_in_order() {
        let transcript: Vec<Vec<u8>> = vec![
            encode_frame(Action::Connect, &[]),
            encode_frame(Action::Join, &["room42"]),
            encode_frame(
                Action::UserList,
                &["alice", "Alice", "268435456|0", "bob", "Bob", "0|0"],
            ),
            encode_frame(Action::Chat, &["first!", "bob", "", "", "", "Bob", "0|0"]),
            encode_frame(Action::Ping, &[]),
            encode_frame(Action::UserJoin, &["carol(2)", "Carol", "0|262144"]),
            encode_frame(Action::TextDonation, &["ch1", "alice", "Alice", "10"]),
            encode_frame(Action::Subscribe, &["bob", "Bob", "3"]),
        ];
        let decoded: Vec<Decoded> = transcript
            .iter()
            .map(|raw| decode(&parse_frame(raw).unwrap()))
            .collect();

        assert_eq!(decoded[0], Decoded::HandshakeAck);
        assert_eq!(decoded[1], Decoded::HandshakeAck);
        match &decoded[2] {
            Decoded::Event(ChannelEvent::UserListSnapshot(v)) => assert_eq!(v.len(), 2),
            other => panic!("expected user list, got {other:?}"),
        }
        match &decoded[3] {
            Decoded::Event(ChannelEvent::Chat(c)) => assert_eq!(c.message, "first!"),
            other => panic!("expected chat, got {other:?}"),
        }
        assert_eq!(decoded[4], Decoded::ReplyPing);
        match &decoded[5] {
            Decoded::Event(ChannelEvent::UserJoin(v)) => assert_eq!(v.user_id, "carol"),
            other => panic!("expected join, got {other:?}"),
        }
        match &decoded[6] {
            Decoded::Event(ChannelEvent::Donation(d)) => assert_eq!(d.amount_krw, 1000),
            other => panic!("expected donation, got {other:?}"),
        }
        match &decoded[7] {
            Decoded::Event(ChannelEvent::Subscription(s)) => assert_eq!(s.months, 3),
            other => panic!("expected subscription, got {other:?}"),
        }
    }
}
