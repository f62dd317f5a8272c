//! Platform category catalog refresh.

use chrono::{DateTime, Utc};
use sc_model::Platform;

use crate::warehouse::MergeStatement;

pub fn upsert_category(
    platform: Platform,
    category_id: &str,
    category_name: &str,
    seen_at: DateTime<Utc>,
) -> MergeStatement {
    MergeStatement::into_target("categories")
        .source("platform", platform.as_str())
        .source("category_id", category_id)
        .source("category_name", category_name)
        .source("seen_at", seen_at)
        .on(&["platform", "category_id"])
        .when_matched_set("category_name", "s.category_name")
        .when_matched_set("last_seen_at", "s.seen_at")
        .when_not_matched_insert("platform", "s.platform")
        .when_not_matched_insert("category_id", "s.category_id")
        .when_not_matched_insert("category_name", "s.category_name")
        .when_not_matched_insert("first_seen_at", "s.seen_at")
        .when_not_matched_insert("last_seen_at", "s.seen_at")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_upsert_keys_on_platform_and_id() {
        let sql = upsert_category(Platform::Soop, "game", "Games", Utc::now()).sql();
        assert!(sql.contains("MERGE INTO categories"));
        assert!(sql.contains("ON t.platform = s.platform AND t.category_id = s.category_id"));
    }
}
