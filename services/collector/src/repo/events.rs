//! Event rows: the append-only activity record, plus the running
//! per-viewer engagement totals.
//!
//! Donations insert one row each, joining the broadcast row to resolve its
//! id from the broadcast key.  Chat events arrive in bulk from the session
//! buffers and go through the driver's batch insert.  Nothing here
//! deduplicates: two identical frames are two rows, by contract.

use chrono::{DateTime, Utc};
use sc_model::{BroadcastKey, ChatMessage, Donation, Platform, Subscription};
use uuid::Uuid;

use crate::warehouse::{MergeStatement, SqlValue, Statement};

/// Column list for chat-event batch inserts; must match
/// [`chat_event_row`] positionally.
pub const CHAT_EVENT_COLS: &[&str] = &[
    "id",
    "event_type",
    "platform",
    "actor_user_id",
    "actor_nickname",
    "actor_role",
    "target_user_id",
    "target_channel_id",
    "broadcast_id",
    "message",
    "amount",
    "original_amount",
    "currency",
    "event_timestamp",
    "ingested_at",
];

/// One chat event as a bind row for `batch_insert`.
pub fn chat_event_row(
    chat: &ChatMessage,
    key: &BroadcastKey,
    streamer_id: &str,
    broadcast_id: Option<i64>,
    event_at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
) -> Vec<SqlValue> {
    vec![
        SqlValue::Uuid(Uuid::new_v4()),
        SqlValue::Text("chat".to_owned()),
        SqlValue::Text(key.platform.as_str().to_owned()),
        SqlValue::Text(chat.user_id.clone()),
        SqlValue::Text(chat.nickname.clone()),
        SqlValue::Text(chat.role.as_str().to_owned()),
        SqlValue::OptText(Some(streamer_id.to_owned())),
        SqlValue::Text(key.channel_id.clone()),
        SqlValue::OptInt(broadcast_id),
        SqlValue::OptText(Some(chat.message.clone())),
        SqlValue::Int(0),
        SqlValue::Int(0),
        SqlValue::Text("KRW".to_owned()),
        SqlValue::Timestamp(event_at),
        SqlValue::Timestamp(ingested_at),
    ]
}

/// Insert one donation event, resolving the broadcast id via its key.
///
/// Inserts zero rows when the broadcast row is unknown; the caller logs
/// and moves on.
pub fn insert_donation(
    donation: &Donation,
    key: &BroadcastKey,
    streamer_id: &str,
    event_at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
) -> Statement {
    Statement::new(
        "INSERT INTO events \
         (id, event_type, platform, actor_user_id, actor_nickname, actor_role, \
          target_user_id, target_channel_id, broadcast_id, message, \
          amount, original_amount, currency, donation_kind, event_timestamp, ingested_at) \
         SELECT $1, 'donation', $2, $3, $4, 'regular', $5, $6, b.id, $7, $8, $9, $10, $11, $12, $13 \
         FROM broadcasts b \
         WHERE b.platform = $2 AND b.channel_id = $6 AND b.broadcast_no = $14",
        vec![
            SqlValue::Uuid(Uuid::new_v4()),
            SqlValue::Text(key.platform.as_str().to_owned()),
            SqlValue::Text(donation.user_id.clone()),
            SqlValue::Text(donation.nickname.clone()),
            SqlValue::OptText(Some(streamer_id.to_owned())),
            SqlValue::Text(key.channel_id.clone()),
            SqlValue::OptText(donation.message.clone()),
            SqlValue::Int(donation.amount_krw),
            SqlValue::Int(donation.original_amount),
            SqlValue::Text(donation.currency.clone()),
            SqlValue::Text(donation.kind.as_str().to_owned()),
            SqlValue::Timestamp(event_at),
            SqlValue::Timestamp(ingested_at),
            SqlValue::Text(key.broadcast_no.clone()),
        ],
    )
}

/// Insert one subscription event (a donation of kind `subscribe`,
/// amount 0, months as the raw figure).
pub fn insert_subscription(
    subscription: &Subscription,
    key: &BroadcastKey,
    streamer_id: &str,
    event_at: DateTime<Utc>,
    ingested_at: DateTime<Utc>,
) -> Statement {
    Statement::new(
        "INSERT INTO events \
         (id, event_type, platform, actor_user_id, actor_nickname, actor_role, \
          target_user_id, target_channel_id, broadcast_id, \
          amount, original_amount, currency, donation_kind, event_timestamp, ingested_at) \
         SELECT $1, 'subscribe', $2, $3, $4, 'regular', $5, $6, b.id, 0, $7, 'KRW', 'subscribe', $8, $9 \
         FROM broadcasts b \
         WHERE b.platform = $2 AND b.channel_id = $6 AND b.broadcast_no = $10",
        vec![
            SqlValue::Uuid(Uuid::new_v4()),
            SqlValue::Text(key.platform.as_str().to_owned()),
            SqlValue::Text(subscription.user_id.clone()),
            SqlValue::Text(subscription.nickname.clone()),
            SqlValue::OptText(Some(streamer_id.to_owned())),
            SqlValue::Text(key.channel_id.clone()),
            SqlValue::Int(subscription.months),
            SqlValue::Timestamp(event_at),
            SqlValue::Timestamp(ingested_at),
            SqlValue::Text(key.broadcast_no.clone()),
        ],
    )
}

/// Accumulate per-(viewer, channel, category) engagement totals.
pub fn bump_engagement(
    platform: Platform,
    viewer_user_id: &str,
    channel_id: &str,
    category_id: Option<&str>,
    chat_delta: i64,
    donation_delta: i64,
    amount_delta: i64,
    seen_at: DateTime<Utc>,
) -> MergeStatement {
    MergeStatement::into_target("viewer_engagement")
        .source("platform", platform.as_str())
        .source("viewer_user_id", viewer_user_id)
        .source("channel_id", channel_id)
        .source("category_id", category_id.unwrap_or(""))
        .source("chat_delta", chat_delta)
        .source("donation_delta", donation_delta)
        .source("amount_delta", amount_delta)
        .source("seen_at", seen_at)
        .on(&["platform", "viewer_user_id", "channel_id", "category_id"])
        .when_matched_set("chat_count", "t.chat_count + s.chat_delta")
        .when_matched_set("donation_count", "t.donation_count + s.donation_delta")
        .when_matched_set("donation_amount", "t.donation_amount + s.amount_delta")
        .when_matched_set("last_seen_at", "s.seen_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("viewer_user_id", "s.viewer_user_id")
        .when_not_matched_insert("channel_id", "s.channel_id")
        .when_not_matched_insert("category_id", "s.category_id")
        .when_not_matched_insert("chat_count", "s.chat_delta")
        .when_not_matched_insert("donation_count", "s.donation_delta")
        .when_not_matched_insert("donation_amount", "s.amount_delta")
        .when_not_matched_insert("first_seen_at", "s.seen_at")
        .when_not_matched_insert("last_seen_at", "s.seen_at")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sc_model::DonationKind;

    fn key() -> BroadcastKey {
        BroadcastKey {
            platform: Platform::Soop,
            channel_id: "ch1".to_owned(),
            broadcast_no: "99".to_owned(),
        }
    }

    #[test]
    fn chat_row_matches_column_list() {
        let chat = ChatMessage {
            user_id: "u1".to_owned(),
            nickname: "Ann".to_owned(),
            role: sc_model::ActorRole::Regular,
            message: "hi".to_owned(),
        };
        let row = chat_event_row(&chat, &key(), "streamer1", Some(4), Utc::now(), Utc::now());
        assert_eq!(row.len(), CHAT_EVENT_COLS.len());
        assert_eq!(row[1], SqlValue::Text("chat".to_owned()));
        assert_eq!(row[8], SqlValue::OptInt(Some(4)));
    }

    #[test]
    fn donation_insert_joins_broadcast_by_key() {
        let donation = Donation {
            user_id: "u1".to_owned(),
            nickname: "Ann".to_owned(),
            kind: DonationKind::Balloon,
            amount_krw: 1000,
            original_amount: 10,
            currency: "KRW".to_owned(),
            message: None,
        };
        let stmt = insert_donation(&donation, &key(), "streamer1", Utc::now(), Utc::now());
        assert!(stmt.sql.contains("FROM broadcasts b"));
        assert!(
            stmt.sql
                .contains("b.platform = $2 AND b.channel_id = $6 AND b.broadcast_no = $14")
        );
        assert_eq!(stmt.binds.len(), 14);
        assert_eq!(stmt.binds[7], SqlValue::Int(1000));
        assert_eq!(stmt.binds[8], SqlValue::Int(10));
    }

    #[test]
    fn replayed_donation_frames_insert_distinct_rows() {
        // The pipeline never dedupes: building the statement twice for the
        // same wire frame yields two inserts with distinct event ids.
        let donation = Donation {
            user_id: "u1".to_owned(),
            nickname: "Ann".to_owned(),
            kind: DonationKind::Cheese,
            amount_krw: 500,
            original_amount: 500,
            currency: "KRW".to_owned(),
            message: None,
        };
        let at = Utc::now();
        let first = insert_donation(&donation, &key(), "s", at, at);
        let second = insert_donation(&donation, &key(), "s", at, at);
        assert_eq!(first.sql, second.sql);
        assert_ne!(first.binds[0], second.binds[0]);
        assert_eq!(first.binds[1..], second.binds[1..]);
    }

    #[test]
    fn subscription_insert_has_zero_amount_and_months_raw() {
        let sub = Subscription {
            user_id: "u2".to_owned(),
            nickname: "Ben".to_owned(),
            months: 6,
        };
        let stmt = insert_subscription(&sub, &key(), "streamer1", Utc::now(), Utc::now());
        assert!(stmt.sql.contains("'subscribe'"));
        assert!(stmt.sql.contains(", 0,"));
        assert_eq!(stmt.binds[6], SqlValue::Int(6));
    }

    #[test]
    fn engagement_accumulates_and_null_category_folds_to_empty() {
        let merge = bump_engagement(
            Platform::Chzzk,
            "u1",
            "ch1",
            None,
            1,
            0,
            0,
            Utc::now(),
        );
        let stmt = merge.to_statement();
        assert!(stmt.sql.contains("chat_count = t.chat_count + s.chat_delta"));
        assert_eq!(stmt.binds[3], SqlValue::Text(String::new()));
    }
}
