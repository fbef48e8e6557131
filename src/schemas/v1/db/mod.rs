pub mod queries;

use sqlx::{Pool, Sqlite};

/// Applies the base catalog schema. Every statement is `IF NOT EXISTS` so the
/// call is safe on an already-initialized database.
pub async fn init_schema(pool: &Pool<Sqlite>) -> Result<(), sqlx::Error> {
    for statement in split_sql_statements(include_str!("../../../../sql/db_init.sql")) {
        if !statement.trim().is_empty() {
            sqlx::query(&statement).execute(pool).await?;
        }
    }
    Ok(())
}

/// Splits a schema file into individual statements. The catalog DDL carries
/// no string literals containing semicolons, so a plain split is enough.
pub fn split_sql_statements(sql: &str) -> Vec<String> {
    sql.split(';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && !s.lines().all(|l| l.trim_start().starts_with("--")))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn base_schema_applies_twice() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&pool).await.unwrap();
        init_schema(&pool).await.unwrap();

        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE name = 'storage_pools'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(n, 1);
    }
}
