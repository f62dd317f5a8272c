//! Person identity upserts.
//!
//! Key: (platform, platform_user_id).  `last_seen_at` only ever advances;
//! a person row is never deleted by the collector.

use chrono::{DateTime, Utc};
use sc_model::{LiveBroadcast, Platform};

use crate::warehouse::MergeStatement;

/// Upsert a viewer/actor identity observed in chat or a viewer list.
pub fn upsert_person(
    platform: Platform,
    user_id: &str,
    nickname: &str,
    seen_at: DateTime<Utc>,
) -> MergeStatement {
    MergeStatement::into_target("persons")
        .source("platform", platform.as_str())
        .source("platform_user_id", user_id)
        .source("nickname", nickname)
        .source("seen_at", seen_at)
        .on(&["platform", "platform_user_id"])
        .when_matched_set("nickname", "s.nickname")
        .when_matched_set("last_seen_at", "s.seen_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("platform_user_id", "s.platform_user_id")
        .when_not_matched_insert("nickname", "s.nickname")
        .when_not_matched_insert("first_seen_at", "s.seen_at")
        .when_not_matched_insert("last_seen_at", "s.seen_at")
}

/// Upsert a broadcaster identity from the live index, carrying the
/// channel id and broadcaster flag.
pub fn upsert_broadcaster(broadcast: &LiveBroadcast, seen_at: DateTime<Utc>) -> MergeStatement {
    MergeStatement::into_target("persons")
        .source("platform", broadcast.key.platform.as_str())
        .source("platform_user_id", broadcast.streamer_id.as_str())
        .source("nickname", broadcast.streamer_nick.as_str())
        .source("channel_id", broadcast.key.channel_id.as_str())
        .source("seen_at", seen_at)
        .on(&["platform", "platform_user_id"])
        .when_matched_set("nickname", "s.nickname")
        .when_matched_set("channel_id", "s.channel_id")
        .when_matched_set("is_broadcaster", "TRUE")
        .when_matched_set("last_broadcast_at", "s.seen_at")
        .when_matched_set("last_seen_at", "s.seen_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("platform_user_id", "s.platform_user_id")
        .when_not_matched_insert("nickname", "s.nickname")
        .when_not_matched_insert("channel_id", "s.channel_id")
        .when_not_matched_insert("is_broadcaster", "TRUE")
        .when_not_matched_insert("last_broadcast_at", "s.seen_at")
        .when_not_matched_insert("first_seen_at", "s.seen_at")
        .when_not_matched_insert("last_seen_at", "s.seen_at")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::SqlValue;

    #[test]
    fn person_upsert_merges_on_platform_identity() {
        let now = Utc::now();
        let stmt = upsert_person(Platform::Chzzk, "hash-1", "Ann", now).to_statement();
        assert!(stmt.sql.starts_with("MERGE INTO persons AS t"));
        assert!(
            stmt.sql
                .contains("ON t.platform = s.platform AND t.platform_user_id = s.platform_user_id")
        );
        assert!(stmt.sql.contains("last_seen_at = s.seen_at"));
        assert!(stmt.sql.contains("first_seen_at"));
        assert_eq!(stmt.binds[0], SqlValue::Text("chzzk".to_owned()));
        assert_eq!(stmt.binds[3], SqlValue::Timestamp(now));
    }

    #[test]
    fn broadcaster_upsert_sets_flag_both_ways() {
        let broadcast = crate::repo::broadcasts::tests::sample_broadcast();
        let sql = upsert_broadcaster(&broadcast, Utc::now()).sql();
        assert!(sql.contains("is_broadcaster = TRUE"));
        assert!(sql.contains("channel_id = s.channel_id"));
    }
}
