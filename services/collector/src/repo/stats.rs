//! Per-bucket aggregate stats.
//!
//! One row per (broadcast, bucket); conflicting writes replace counts.
//! Ratios are computed here so a viewerless bucket cleanly persists zeros
//! instead of a division error, never a synthetic fallback value.

use chrono::{DateTime, Utc};

use crate::warehouse::MergeStatement;

/// Input counts for one bucket of one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BucketStats {
    pub viewer_count: i64,
    pub subscriber_count: i64,
    pub fan_count: i64,
    pub chat_count: i64,
    pub unique_chatters: i64,
}

impl BucketStats {
    pub fn subscriber_ratio(&self) -> f64 {
        ratio(self.subscriber_count, self.viewer_count)
    }

    pub fn fan_ratio(&self) -> f64 {
        ratio(self.fan_count, self.viewer_count)
    }
}

fn ratio(part: i64, whole: i64) -> f64 {
    if whole <= 0 {
        0.0
    } else {
        part as f64 / whole as f64
    }
}

/// Merge the bucket aggregate; replace-on-conflict.
pub fn merge_stats_5min(
    broadcast_id: i64,
    bucket: DateTime<Utc>,
    stats: BucketStats,
) -> MergeStatement {
    MergeStatement::into_target("broadcast_stats_5min")
        .source("broadcast_id", broadcast_id)
        .source("snapshot_at", bucket)
        .source("viewer_count", stats.viewer_count)
        .source("subscriber_count", stats.subscriber_count)
        .source("fan_count", stats.fan_count)
        .source("subscriber_ratio", stats.subscriber_ratio())
        .source("fan_ratio", stats.fan_ratio())
        .source("chat_count", stats.chat_count)
        .source("unique_chatters", stats.unique_chatters)
        .on(&["broadcast_id", "snapshot_at"])
        .when_matched_set("viewer_count", "s.viewer_count")
        .when_matched_set("subscriber_count", "s.subscriber_count")
        .when_matched_set("fan_count", "s.fan_count")
        .when_matched_set("subscriber_ratio", "s.subscriber_ratio")
        .when_matched_set("fan_ratio", "s.fan_ratio")
        .when_matched_set("chat_count", "s.chat_count")
        .when_matched_set("unique_chatters", "s.unique_chatters")
        .when_not_matched_insert("broadcast_id", "s.broadcast_id")
        .when_not_matched_insert("snapshot_at", "s.snapshot_at")
        .when_not_matched_insert("viewer_count", "s.viewer_count")
        .when_not_matched_insert("subscriber_count", "s.subscriber_count")
        .when_not_matched_insert("fan_count", "s.fan_count")
        .when_not_matched_insert("subscriber_ratio", "s.subscriber_ratio")
        .when_not_matched_insert("fan_ratio", "s.fan_ratio")
        .when_not_matched_insert("chat_count", "s.chat_count")
        .when_not_matched_insert("unique_chatters", "s.unique_chatters")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::warehouse::SqlValue;

    #[test]
    fn ratios_follow_the_counts() {
        let stats = BucketStats {
            viewer_count: 10,
            subscriber_count: 3,
            fan_count: 2,
            chat_count: 42,
            unique_chatters: 8,
        };
        assert!((stats.subscriber_ratio() - 0.3).abs() < 1e-9);
        assert!((stats.fan_ratio() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn zero_viewers_gives_zero_ratios() {
        let stats = BucketStats {
            subscriber_count: 3,
            fan_count: 2,
            ..BucketStats::default()
        };
        assert_eq!(stats.subscriber_ratio(), 0.0);
        assert_eq!(stats.fan_ratio(), 0.0);
    }

    #[test]
    fn merge_replaces_every_count_on_conflict() {
        let stats = BucketStats {
            viewer_count: 10,
            subscriber_count: 3,
            fan_count: 2,
            chat_count: 42,
            unique_chatters: 8,
        };
        let stmt = merge_stats_5min(9, Utc::now(), stats).to_statement();
        assert!(stmt.sql.contains("MERGE INTO broadcast_stats_5min"));
        assert!(
            stmt.sql
                .contains("ON t.broadcast_id = s.broadcast_id AND t.snapshot_at = s.snapshot_at")
        );
        assert!(stmt.sql.contains("chat_count = s.chat_count"));
        assert_eq!(stmt.binds[2], SqlValue::Int(10));
        assert_eq!(stmt.binds[5], SqlValue::Float(0.3));
        assert_eq!(stmt.binds[7], SqlValue::Int(42));
        assert_eq!(stmt.binds[8], SqlValue::Int(8));
    }
}
