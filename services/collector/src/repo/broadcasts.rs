//! Broadcast lifecycle writes: upsert on poll, close on disappearance,
//! title/category change rows, and category-stable segments.

use chrono::{DateTime, Utc};
use sc_model::{BroadcastKey, LiveBroadcast};

use crate::warehouse::{MergeStatement, SqlValue, Statement, Warehouse, WarehouseError};

/// Upsert one broadcast observed in the live index.
///
/// On match the peak is `GREATEST(existing, observed)` and the running
/// viewer sum / snapshot count advance; on miss the row starts with the
/// observed figures.  `is_live` is forced true either way.
pub fn upsert_broadcast(broadcast: &LiveBroadcast, observed_at: DateTime<Utc>) -> MergeStatement {
    let tags_json = serde_json::to_string(&broadcast.tags).unwrap_or_else(|_| "[]".to_owned());
    MergeStatement::into_target("broadcasts")
        .source("platform", broadcast.key.platform.as_str())
        .source("channel_id", broadcast.key.channel_id.as_str())
        .source("broadcast_no", broadcast.key.broadcast_no.as_str())
        .source("broadcaster_user_id", broadcast.streamer_id.as_str())
        .source("title", broadcast.title.as_str())
        .source("category_id", broadcast.category_id.clone())
        .source("category_name", broadcast.category_name.clone())
        .source("tags", tags_json)
        .source("thumbnail", broadcast.thumbnail.clone())
        .source("viewers", broadcast.viewers)
        .source("started_at", broadcast.started_at)
        .source("observed_at", observed_at)
        .on(&["platform", "channel_id", "broadcast_no"])
        .when_matched_set("title", "s.title")
        .when_matched_set("category_id", "s.category_id")
        .when_matched_set("category_name", "s.category_name")
        .when_matched_set("thumbnail", "s.thumbnail")
        .when_matched_set("current_viewers", "s.viewers")
        .when_matched_set("peak_viewers", "GREATEST(t.peak_viewers, s.viewers)")
        .when_matched_set("viewer_sum", "t.viewer_sum + s.viewers")
        .when_matched_set("snapshot_count", "t.snapshot_count + 1")
        .when_matched_set("is_live", "TRUE")
        .when_matched_set("last_observed_at", "s.observed_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("channel_id", "s.channel_id")
        .when_not_matched_insert("broadcast_no", "s.broadcast_no")
        .when_not_matched_insert("broadcaster_user_id", "s.broadcaster_user_id")
        .when_not_matched_insert("title", "s.title")
        .when_not_matched_insert("category_id", "s.category_id")
        .when_not_matched_insert("category_name", "s.category_name")
        .when_not_matched_insert("tags", "s.tags")
        .when_not_matched_insert("thumbnail", "s.thumbnail")
        .when_not_matched_insert("current_viewers", "s.viewers")
        .when_not_matched_insert("peak_viewers", "s.viewers")
        .when_not_matched_insert("viewer_sum", "s.viewers")
        .when_not_matched_insert("snapshot_count", "1")
        .when_not_matched_insert("is_live", "TRUE")
        .when_not_matched_insert("started_at", "COALESCE(s.started_at, s.observed_at)")
        .when_not_matched_insert("first_observed_at", "s.observed_at")
        .when_not_matched_insert("last_observed_at", "s.observed_at")
}

/// Close a broadcast that disappeared from the live index.
pub fn mark_broadcast_ended(key: &BroadcastKey, ended_at: DateTime<Utc>) -> Statement {
    Statement::new(
        "UPDATE broadcasts SET is_live = FALSE, ended_at = $4, \
         duration_seconds = CAST(EXTRACT(EPOCH FROM ($4 - started_at)) AS BIGINT) \
         WHERE platform = $1 AND channel_id = $2 AND broadcast_no = $3 AND is_live = TRUE",
        vec![
            SqlValue::Text(key.platform.as_str().to_owned()),
            SqlValue::Text(key.channel_id.clone()),
            SqlValue::Text(key.broadcast_no.clone()),
            SqlValue::Timestamp(ended_at),
        ],
    )
}

/// Startup recovery: close every broadcast left live by an unclean shutdown.
pub fn close_stale_live(now: DateTime<Utc>) -> Statement {
    Statement::new(
        "UPDATE broadcasts SET is_live = FALSE, ended_at = $1, \
         duration_seconds = CAST(EXTRACT(EPOCH FROM ($1 - started_at)) AS BIGINT) \
         WHERE is_live = TRUE",
        vec![SqlValue::Timestamp(now)],
    )
}

/// Startup recovery companion: close segments left open by an unclean
/// shutdown.
pub fn close_stale_segments(now: DateTime<Utc>) -> Statement {
    Statement::new(
        "UPDATE broadcast_segments SET ended_at = $1 WHERE ended_at IS NULL",
        vec![SqlValue::Timestamp(now)],
    )
}

/// Append one title/category change row.
pub fn record_change(
    broadcast_id: i64,
    field: &str,
    old_value: &str,
    new_value: &str,
    changed_at: DateTime<Utc>,
) -> Statement {
    Statement::new(
        "INSERT INTO broadcast_changes (broadcast_id, field, old_value, new_value, changed_at) \
         VALUES ($1, $2, $3, $4, $5)",
        vec![
            SqlValue::Int(broadcast_id),
            SqlValue::Text(field.to_owned()),
            SqlValue::Text(old_value.to_owned()),
            SqlValue::Text(new_value.to_owned()),
            SqlValue::Timestamp(changed_at),
        ],
    )
}

/// Open a new category-stable segment.
pub fn open_segment(
    broadcast_id: i64,
    broadcast: &LiveBroadcast,
    started_at: DateTime<Utc>,
) -> Statement {
    Statement::new(
        "INSERT INTO broadcast_segments \
         (broadcast_id, platform, channel_id, category_id, category_name, started_at, peak_viewers) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
        vec![
            SqlValue::Int(broadcast_id),
            SqlValue::Text(broadcast.key.platform.as_str().to_owned()),
            SqlValue::Text(broadcast.key.channel_id.clone()),
            SqlValue::OptText(broadcast.category_id.clone()),
            SqlValue::OptText(broadcast.category_name.clone()),
            SqlValue::Timestamp(started_at),
            SqlValue::Int(broadcast.viewers),
        ],
    )
}

/// Close the open segment, if any.  Segments never overlap: at most one
/// row per broadcast has a NULL `ended_at`.
pub fn close_open_segment(broadcast_id: i64, ended_at: DateTime<Utc>) -> Statement {
    Statement::new(
        "UPDATE broadcast_segments SET ended_at = $2 \
         WHERE broadcast_id = $1 AND ended_at IS NULL",
        vec![SqlValue::Int(broadcast_id), SqlValue::Timestamp(ended_at)],
    )
}

/// Track the segment-local viewer peak.
pub fn bump_segment_peak(broadcast_id: i64, viewers: i64) -> Statement {
    Statement::new(
        "UPDATE broadcast_segments SET peak_viewers = GREATEST(peak_viewers, $2) \
         WHERE broadcast_id = $1 AND ended_at IS NULL",
        vec![SqlValue::Int(broadcast_id), SqlValue::Int(viewers)],
    )
}

/// Resolve the surrogate id for a broadcast key.
pub async fn broadcast_id(
    warehouse: &Warehouse,
    key: &BroadcastKey,
) -> Result<Option<i64>, WarehouseError> {
    let row = warehouse
        .get(
            "SELECT id FROM broadcasts WHERE platform = $1 AND channel_id = $2 AND broadcast_no = $3",
            &[
                SqlValue::Text(key.platform.as_str().to_owned()),
                SqlValue::Text(key.channel_id.clone()),
                SqlValue::Text(key.broadcast_no.clone()),
            ],
        )
        .await?;
    Ok(row.and_then(|r| r.int("id")))
}

/// Resolve the open segment id for a broadcast, if one exists.
pub async fn open_segment_id(
    warehouse: &Warehouse,
    broadcast_id: i64,
) -> Result<Option<i64>, WarehouseError> {
    let row = warehouse
        .get(
            "SELECT id FROM broadcast_segments WHERE broadcast_id = $1 AND ended_at IS NULL \
             ORDER BY started_at DESC LIMIT 1",
            &[SqlValue::Int(broadcast_id)],
        )
        .await?;
    Ok(row.and_then(|r| r.int("id")))
}
