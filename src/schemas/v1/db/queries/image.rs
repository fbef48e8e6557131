use crate::schemas::v1::models::image::Image;
use anyhow::Context;
use sqlx::{Pool, Sqlite};

pub async fn image_list(pool: &Pool<Sqlite>) -> anyhow::Result<Vec<Image>> {
    let images = sqlx::query_as::<_, Image>("SELECT * FROM images ORDER BY fingerprint")
        .fetch_all(pool)
        .await
        .context("Failed to fetch images")?;

    Ok(images)
}

pub async fn image_get_by_fingerprint(
    pool: &Pool<Sqlite>,
    fingerprint: &str,
) -> anyhow::Result<Option<Image>> {
    let image = sqlx::query_as::<_, Image>("SELECT * FROM images WHERE fingerprint = ?")
        .bind(fingerprint)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch image")?;

    Ok(image)
}

/// Records an image in the cache index, updating size/filename when the
/// fingerprint is already present.
pub async fn image_ensure(
    pool: &Pool<Sqlite>,
    fingerprint: &str,
    filename: &str,
    size: i64,
) -> anyhow::Result<()> {
    sqlx::query(
        r#"INSERT INTO images (fingerprint, filename, size) VALUES (?, ?, ?)
        ON CONFLICT (fingerprint) DO UPDATE SET filename = excluded.filename, size = excluded.size"#,
    )
    .bind(fingerprint)
    .bind(filename)
    .bind(size)
    .execute(pool)
    .await
    .context("Failed to record image")?;

    Ok(())
}
