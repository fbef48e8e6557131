use crate::schemas::v1::models::instance::{Instance, InstancePlacement};
use anyhow::Context;
use sqlx::{Pool, Sqlite};

/// Retrieves every instance of a project joined with its node, optionally
/// filtered by instance kind. This is the clustered read the listing fan-out
/// starts from.
pub async fn instance_placements(
    pool: &Pool<Sqlite>,
    project: &str,
    kind: Option<&str>,
) -> anyhow::Result<Vec<InstancePlacement>> {
    let mut query_builder = sqlx::QueryBuilder::new(
        r#"SELECT i.name, i.kind, i.project, i.status,
            n.name AS node_name, n.address AS node_address
        FROM instances i LEFT JOIN nodes n ON n.id = i.node_id
        WHERE i.project = "#,
    );
    query_builder.push_bind(project);

    if let Some(kind) = kind {
        query_builder.push(" AND i.kind = ");
        query_builder.push_bind(kind);
    }
    query_builder.push(" ORDER BY i.name");

    let placements = query_builder
        .build_query_as::<InstancePlacement>()
        .fetch_all(pool)
        .await
        .context("Failed to fetch instance placements")?;

    Ok(placements)
}

/// Retrieves a single instance by project and name.
pub async fn instance_get(
    pool: &Pool<Sqlite>,
    project: &str,
    name: &str,
) -> anyhow::Result<Option<Instance>> {
    let instance = sqlx::query_as::<_, Instance>(
        "SELECT * FROM instances WHERE project = ? AND name = ?",
    )
    .bind(project)
    .bind(name)
    .fetch_optional(pool)
    .await
    .context("Failed to fetch instance")?;

    Ok(instance)
}

/// All instance names in a project, sorted.
pub async fn instance_names(pool: &Pool<Sqlite>, project: &str) -> anyhow::Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        "SELECT name FROM instances WHERE project = ? ORDER BY name",
    )
    .bind(project)
    .fetch_all(pool)
    .await
    .context("Failed to fetch instance names")?;

    Ok(names)
}

/// Instances whose disk devices attach the given custom volume.
pub async fn instances_using_volume(
    pool: &Pool<Sqlite>,
    pool_name: &str,
    volume_name: &str,
) -> anyhow::Result<Vec<String>> {
    let names = sqlx::query_scalar::<_, String>(
        r#"SELECT DISTINCT i.name
        FROM instances i
        JOIN instances_devices d ON d.instance_id = i.id
        JOIN instances_devices_config cp
            ON cp.instance_device_id = d.id AND cp.key = 'pool' AND cp.value = ?
        JOIN instances_devices_config cs
            ON cs.instance_device_id = d.id AND cs.key = 'source' AND cs.value = ?
        WHERE d.type = 'disk'
        ORDER BY i.name"#,
    )
    .bind(pool_name)
    .bind(volume_name)
    .fetch_all(pool)
    .await
    .context("Failed to fetch instances using volume")?;

    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::v1::db::init_schema;
    use crate::schemas::v1::db::queries::node;

    async fn test_pool() -> Pool<Sqlite> {
        let db = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        init_schema(&db).await.unwrap();
        db
    }

    async fn seed_instance(db: &Pool<Sqlite>, name: &str, node_id: Option<i64>) -> i64 {
        let result = sqlx::query(
            "INSERT INTO instances (node_id, name, kind, project, status) VALUES (?, ?, 'container', 'default', 'running')",
        )
        .bind(node_id)
        .bind(name)
        .execute(db)
        .await
        .unwrap();
        result.last_insert_rowid()
    }

    #[tokio::test]
    async fn placements_join_node_and_sort() {
        let db = test_pool().await;
        let n1 = node::node_ensure(&db, "node-a", "10.0.0.1:8443").await.unwrap();
        seed_instance(&db, "zeta", Some(n1)).await;
        seed_instance(&db, "alpha", None).await;

        let placements = instance_placements(&db, "default", None).await.unwrap();
        assert_eq!(
            placements.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
            vec!["alpha", "zeta"]
        );
        assert_eq!(placements[1].node_name.as_deref(), Some("node-a"));
        assert!(placements[0].node_name.is_none());
    }

    #[tokio::test]
    async fn volume_attachment_lookup() {
        let db = test_pool().await;
        let iid = seed_instance(&db, "web1", None).await;
        let dev = sqlx::query(
            "INSERT INTO instances_devices (instance_id, name, type) VALUES (?, 'data', 'disk')",
        )
        .bind(iid)
        .execute(&db)
        .await
        .unwrap()
        .last_insert_rowid();
        for (k, v) in [("pool", "p1"), ("source", "v1"), ("path", "/data")] {
            sqlx::query(
                "INSERT INTO instances_devices_config (instance_device_id, key, value) VALUES (?, ?, ?)",
            )
            .bind(dev)
            .bind(k)
            .bind(v)
            .execute(&db)
            .await
            .unwrap();
        }

        assert_eq!(
            instances_using_volume(&db, "p1", "v1").await.unwrap(),
            vec!["web1".to_string()]
        );
        assert!(instances_using_volume(&db, "p1", "other").await.unwrap().is_empty());
    }
}
