//! The single MERGE builder.
//!
//! All upsert SQL is declared through [`MergeStatement`] rather than inline
//! strings, so every merge in the codebase renders through one place and
//! the test suite can assert the exact statements the collector would run.
//!
//! Rendered shape:
//!
//! ```sql
//! MERGE INTO <target> AS t
//! USING (SELECT $1 AS a, $2 AS b) AS s
//! ON t.a = s.a AND t.b = s.b
//! WHEN MATCHED THEN UPDATE SET x = <expr>, ...
//! WHEN NOT MATCHED THEN INSERT (x, ...) VALUES (<expr>, ...)
//! ```
//!
//! Update/insert expressions reference source columns as `s.<col>` and may
//! use plain SQL (`now()`, `GREATEST(t.peak_viewers, s.viewers)`).

use super::statement::{SqlValue, Statement};

#[derive(Debug, Clone)]
pub struct MergeStatement {
    target: String,
    source_cols: Vec<String>,
    binds: Vec<SqlValue>,
    on_cols: Vec<String>,
    update_sets: Vec<(String, String)>,
    insert_cols: Vec<(String, String)>,
}

impl MergeStatement {
    pub fn into_target(target: &str) -> MergeStatement {
        MergeStatement {
            target: target.to_owned(),
            source_cols: Vec::new(),
            binds: Vec::new(),
            on_cols: Vec::new(),
            update_sets: Vec::new(),
            insert_cols: Vec::new(),
        }
    }

    /// Add a bound source column (`$n AS <col>`).
    pub fn source(mut self, col: &str, value: impl Into<SqlValue>) -> MergeStatement {
        self.source_cols.push(col.to_owned());
        self.binds.push(value.into());
        self
    }

    /// Match condition columns; each becomes `t.<col> = s.<col>`.
    pub fn on(mut self, cols: &[&str]) -> MergeStatement {
        self.on_cols = cols.iter().map(|&c| c.to_owned()).collect();
        self
    }

    /// `WHEN MATCHED THEN UPDATE SET <col> = <expr>`.
    pub fn when_matched_set(mut self, col: &str, expr: &str) -> MergeStatement {
        self.update_sets.push((col.to_owned(), expr.to_owned()));
        self
    }

    /// `WHEN NOT MATCHED THEN INSERT (<col>, ...) VALUES (<expr>, ...)`.
    pub fn when_not_matched_insert(mut self, col: &str, expr: &str) -> MergeStatement {
        self.insert_cols.push((col.to_owned(), expr.to_owned()));
        self
    }

    /// Render the deterministic SQL text.
    pub fn sql(&self) -> String {
        let source_list = self
            .source_cols
            .iter()
            .enumerate()
            .map(|(i, col)| format!("${} AS {}", i + 1, col))
            .collect::<Vec<_>>()
            .join(", ");
        let on_clause = self
            .on_cols
            .iter()
            .map(|col| format!("t.{col} = s.{col}"))
            .collect::<Vec<_>>()
            .join(" AND ");

        let mut sql = format!(
            "MERGE INTO {} AS t USING (SELECT {}) AS s ON {}",
            self.target, source_list, on_clause
        );
        if self.update_sets.is_empty() {
            sql.push_str(" WHEN MATCHED THEN DO NOTHING");
        } else {
            let sets = self
                .update_sets
                .iter()
                .map(|(col, expr)| format!("{col} = {expr}"))
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(" WHEN MATCHED THEN UPDATE SET {sets}"));
        }
        if !self.insert_cols.is_empty() {
            let cols = self
                .insert_cols
                .iter()
                .map(|(col, _)| col.clone())
                .collect::<Vec<_>>()
                .join(", ");
            let values = self
                .insert_cols
                .iter()
                .map(|(_, expr)| expr.clone())
                .collect::<Vec<_>>()
                .join(", ");
            sql.push_str(&format!(
                " WHEN NOT MATCHED THEN INSERT ({cols}) VALUES ({values})"
            ));
        }
        sql
    }

    pub fn to_statement(&self) -> Statement {
        Statement::new(self.sql(), self.binds.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_full_merge() {
        let merge = MergeStatement::into_target("persons")
            .source("platform", "soop")
            .source("platform_user_id", "u1")
            .source("nickname", "Nick")
            .on(&["platform", "platform_user_id"])
            .when_matched_set("nickname", "s.nickname")
            .when_matched_set("last_seen_at", "now()")
            .when_not_matched_insert("platform", "s.platform")
            .when_not_matched_insert("platform_user_id", "s.platform_user_id")
            .when_not_matched_insert("nickname", "s.nickname");

        assert_eq!(
            merge.sql(),
            "MERGE INTO persons AS t \
             USING (SELECT $1 AS platform, $2 AS platform_user_id, $3 AS nickname) AS s \
             ON t.platform = s.platform AND t.platform_user_id = s.platform_user_id \
             WHEN MATCHED THEN UPDATE SET nickname = s.nickname, last_seen_at = now() \
             WHEN NOT MATCHED THEN INSERT (platform, platform_user_id, nickname) \
             VALUES (s.platform, s.platform_user_id, s.nickname)"
        );
        let stmt = merge.to_statement();
        assert_eq!(stmt.binds.len(), 3);
        assert_eq!(stmt.binds[0], SqlValue::Text("soop".to_owned()));
    }

    #[test]
    fn matched_without_updates_renders_do_nothing() {
        let merge = MergeStatement::into_target("categories")
            .source("platform", "chzzk")
            .source("category_id", "talk")
            .on(&["platform", "category_id"])
            .when_not_matched_insert("platform", "s.platform")
            .when_not_matched_insert("category_id", "s.category_id");
        assert!(merge.sql().contains("WHEN MATCHED THEN DO NOTHING"));
    }

    #[test]
    fn binds_keep_source_order() {
        let now = chrono::Utc::now();
        let merge = MergeStatement::into_target("t")
            .source("a", 5_i64)
            .source("b", now)
            .source("c", Option::<String>::None)
            .on(&["a"]);
        let stmt = merge.to_statement();
        assert_eq!(
            stmt.binds,
            vec![
                SqlValue::Int(5),
                SqlValue::Timestamp(now),
                SqlValue::OptText(None)
            ]
        );
    }
}
