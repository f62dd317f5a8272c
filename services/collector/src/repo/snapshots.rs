//! Viewer snapshot and viewing-record writes.
//!
//! Snapshots are quantized: `snapshot_at` is always a bucket boundary and
//! at most one row exists per (broadcast, bucket); the merge replaces
//! counts on conflict.

use chrono::{DateTime, Utc};
use sc_model::LiveBroadcast;

use crate::warehouse::{MergeStatement, SqlValue, Statement};

/// Bucketed viewer snapshot from the API poll.  Replaces the viewer count
/// on conflict within the same bucket.
pub fn save_broadcast_snapshot(
    broadcast_id: i64,
    segment_id: Option<i64>,
    broadcast: &LiveBroadcast,
    bucket: DateTime<Utc>,
) -> MergeStatement {
    MergeStatement::into_target("viewer_snapshots")
        .source("broadcast_id", broadcast_id)
        .source("snapshot_at", bucket)
        .source("platform", broadcast.key.platform.as_str())
        .source("channel_id", broadcast.key.channel_id.as_str())
        .source("segment_id", segment_id)
        .source("viewer_count", broadcast.viewers)
        .on(&["broadcast_id", "snapshot_at"])
        .when_matched_set("viewer_count", "s.viewer_count")
        .when_matched_set("segment_id", "s.segment_id")
        .when_not_matched_insert("broadcast_id", "s.broadcast_id")
        .when_not_matched_insert("snapshot_at", "s.snapshot_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("channel_id", "s.channel_id")
        .when_not_matched_insert("segment_id", "s.segment_id")
        .when_not_matched_insert("viewer_count", "s.viewer_count")
}

/// Fill in the chat rate for a bucket once the session counters are
/// drained.  Inserts the row if the poll never wrote one (session-only
/// broadcasts that dropped out of the index mid-bucket).
pub fn merge_snapshot_chat_rate(
    broadcast_id: i64,
    broadcast: &LiveBroadcast,
    bucket: DateTime<Utc>,
    session_viewers: i64,
    chat_rate_per_min: f64,
) -> MergeStatement {
    MergeStatement::into_target("viewer_snapshots")
        .source("broadcast_id", broadcast_id)
        .source("snapshot_at", bucket)
        .source("platform", broadcast.key.platform.as_str())
        .source("channel_id", broadcast.key.channel_id.as_str())
        .source("viewer_count", session_viewers)
        .source("chat_rate", chat_rate_per_min)
        .on(&["broadcast_id", "snapshot_at"])
        .when_matched_set("chat_rate", "s.chat_rate")
        .when_not_matched_insert("broadcast_id", "s.broadcast_id")
        .when_not_matched_insert("snapshot_at", "s.snapshot_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("channel_id", "s.channel_id")
        .when_not_matched_insert("viewer_count", "s.viewer_count")
        .when_not_matched_insert("chat_rate", "s.chat_rate")
}

/// Idempotent per-viewer presence record.
///
/// The NOT EXISTS guard keys on (viewer, broadcast, bucket), so replaying
/// the same snapshot cycle cannot double-insert.
pub fn insert_viewing_record(
    viewer_user_id: &str,
    platform: &str,
    broadcast_id: i64,
    bucket: DateTime<Utc>,
    is_subscriber: bool,
    is_fan: bool,
) -> Statement {
    Statement::new(
        "INSERT INTO viewing_records \
         (viewer_user_id, platform, broadcast_id, snapshot_at, is_subscriber, is_fan) \
         SELECT $1, $2, $3, $4, $5, $6 \
         WHERE NOT EXISTS (SELECT 1 FROM viewing_records \
         WHERE viewer_user_id = $1 AND broadcast_id = $3 AND snapshot_at = $4)",
        vec![
            SqlValue::Text(viewer_user_id.to_owned()),
            SqlValue::Text(platform.to_owned()),
            SqlValue::Int(broadcast_id),
            SqlValue::Timestamp(bucket),
            SqlValue::Bool(is_subscriber),
            SqlValue::Bool(is_fan),
        ],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::broadcasts::tests::sample_broadcast;

    #[test]
    fn snapshot_merges_on_broadcast_and_bucket() {
        let sql = save_broadcast_snapshot(3, Some(11), &sample_broadcast(), Utc::now()).sql();
        assert!(sql.contains("ON t.broadcast_id = s.broadcast_id AND t.snapshot_at = s.snapshot_at"));
        assert!(sql.contains("viewer_count = s.viewer_count"));
    }

    #[test]
    fn viewing_record_guard_matches_its_own_key() {
        let stmt = insert_viewing_record("v1", "soop", 3, Utc::now(), true, false);
        assert!(stmt.sql.contains("WHERE NOT EXISTS"));
        assert!(
            stmt.sql
                .contains("viewer_user_id = $1 AND broadcast_id = $3 AND snapshot_at = $4")
        );
        assert_eq!(stmt.binds.len(), 6);
        assert_eq!(stmt.binds[4], SqlValue::Bool(true));
    }

    #[test]
    fn chat_rate_merge_only_replaces_rate_on_match() {
        let merge = merge_snapshot_chat_rate(3, &sample_broadcast(), Utc::now(), 42, 8.4);
        let sql = merge.sql();
        let update = sql
            .split("WHEN MATCHED THEN UPDATE SET")
            .nth(1)
            .unwrap()
            .split("WHEN NOT MATCHED")
            .next()
            .unwrap();
        assert!(update.contains("chat_rate = s.chat_rate"));
        assert!(!update.contains("viewer_count"));
    }
}
