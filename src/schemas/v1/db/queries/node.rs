use crate::schemas::v1::models::node::Node;
use anyhow::Context;
use sqlx::{Pool, Sqlite};

pub async fn node_list(pool: &Pool<Sqlite>) -> anyhow::Result<Vec<Node>> {
    let nodes = sqlx::query_as::<_, Node>("SELECT * FROM nodes ORDER BY name")
        .fetch_all(pool)
        .await
        .context("Failed to fetch nodes")?;

    Ok(nodes)
}

pub async fn node_get_by_name(pool: &Pool<Sqlite>, name: &str) -> anyhow::Result<Option<Node>> {
    let node = sqlx::query_as::<_, Node>("SELECT * FROM nodes WHERE name = ?")
        .bind(name)
        .fetch_optional(pool)
        .await
        .context("Failed to fetch node")?;

    Ok(node)
}

/// Registers a node, updating the address when the row already exists.
/// Returns the node id.
pub async fn node_ensure(pool: &Pool<Sqlite>, name: &str, address: &str) -> anyhow::Result<i64> {
    sqlx::query(
        "INSERT INTO nodes (name, address) VALUES (?, ?) ON CONFLICT (name) DO UPDATE SET address = excluded.address",
    )
    .bind(name)
    .bind(address)
    .execute(pool)
    .await
    .context("Failed to register node")?;

    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM nodes WHERE name = ?")
        .bind(name)
        .fetch_one(pool)
        .await
        .context("Failed to resolve node id")?;

    Ok(id)
}

/// Marks a node unavailable by pointing its address at the offline sentinel.
pub async fn node_mark_offline(pool: &Pool<Sqlite>, name: &str) -> anyhow::Result<()> {
    sqlx::query("UPDATE nodes SET address = ? WHERE name = ?")
        .bind(crate::schemas::v1::models::node::OFFLINE_ADDRESS)
        .bind(name)
        .execute(pool)
        .await
        .context("Failed to mark node offline")?;

    Ok(())
}
