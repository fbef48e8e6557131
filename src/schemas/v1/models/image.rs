use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct Image {
    pub id: i64,
    pub fingerprint: String,
    pub filename: String,
    pub size: i64,
    pub created_at: DateTime<Utc>,
}
