//! PostgreSQL-backed `ResourceStore` implementation

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use sqlx::{postgres::PgRow, PgPool, Postgres, Row, Transaction};
use std::collections::HashSet;
use uuid::Uuid;

use super::traits::{resource_identity, stamp_meta, ResourceStore};
use crate::{
    models::{
        BatchCounts, Conflict, PartitionId, ReferenceLink, RequestPartition, ResourceKey,
        SearchCriteria, StoredResource,
    },
    services::indexing::{reference_links, LAST_UPDATED_PARAM},
    Error, Result,
};

/// Incoming links to the batch whose source lies outside the allowed referrers.
const OUTSIDE_REFERRER_SQL: &str = r#"
    SELECT sr.resource_type, sr.resource_id, sr.parameter_path, sr.target_type, sr.target_id
    FROM search_reference sr
    JOIN unnest($1::text[], $2::text[]) AS b(target_type, target_id)
      ON sr.target_type = b.target_type AND sr.target_id = b.target_id
    WHERE NOT EXISTS (
        SELECT 1 FROM unnest($3::text[], $4::text[]) AS a(resource_type, resource_id)
        WHERE a.resource_type = sr.resource_type AND a.resource_id = sr.resource_id
    )
    ORDER BY sr.target_type, sr.target_id, sr.resource_type, sr.resource_id
    LIMIT 1
"#;

/// PostgreSQL-backed ResourceStore implementation
#[derive(Clone)]
pub struct PostgresResourceStore {
    pub(crate) pool: PgPool,
}

impl PostgresResourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn split_keys<'a>(keys: impl IntoIterator<Item = &'a ResourceKey>) -> (Vec<String>, Vec<String>) {
        keys.into_iter()
            .map(|k| (k.resource_type.clone(), k.id.clone()))
            .unzip()
    }

    fn row_to_resource(row: &PgRow) -> StoredResource {
        StoredResource {
            key: ResourceKey::new(
                row.get::<String, _>("resource_type"),
                row.get::<String, _>("id"),
            ),
            version_id: row.get("version_id"),
            partition: PartitionId::new(row.get::<String, _>("partition_id")),
            resource: row.get("resource"),
            last_updated: row.get("last_updated"),
        }
    }

    fn row_to_link(row: &PgRow) -> ReferenceLink {
        ReferenceLink {
            source: ResourceKey::new(
                row.get::<String, _>("resource_type"),
                row.get::<String, _>("resource_id"),
            ),
            source_partition: PartitionId::new(row.get::<String, _>("source_partition")),
            path: row.get("parameter_path"),
            target: ResourceKey::new(
                row.get::<String, _>("target_type"),
                row.get::<String, _>("target_id"),
            ),
        }
    }

    async fn insert_version(
        tx: &mut Transaction<'_, Postgres>,
        stored: &StoredResource,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO resources (resource_type, id, version_id, partition_id, resource, last_updated, is_current)
             VALUES ($1, $2, $3, $4, $5, $6, true)",
        )
        .bind(&stored.key.resource_type)
        .bind(&stored.key.id)
        .bind(stored.version_id)
        .bind(stored.partition.as_str())
        .bind(&stored.resource)
        .bind(stored.last_updated)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    /// Replace the `search_reference` and `search_date` rows of a resource.
    async fn write_index_rows(
        tx: &mut Transaction<'_, Postgres>,
        stored: &StoredResource,
    ) -> Result<()> {
        let key = &stored.key;
        sqlx::query("DELETE FROM search_reference WHERE resource_type = $1 AND resource_id = $2")
            .bind(&key.resource_type)
            .bind(&key.id)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;

        let links = reference_links(stored);
        if !links.is_empty() {
            let paths: Vec<String> = links.iter().map(|l| l.path.clone()).collect();
            let (target_types, target_ids) = Self::split_keys(links.iter().map(|l| &l.target));

            // Conflicts with the FOR UPDATE an expunge batch holds on its members: either the
            // batch commits first and the target is gone, or it sees this link on re-check.
            sqlx::query(
                "SELECT 1 FROM resource_versions rv
                 JOIN unnest($1::text[], $2::text[]) AS t(resource_type, id)
                   ON rv.resource_type = t.resource_type AND rv.id = t.id
                 ORDER BY rv.resource_type, rv.id
                 FOR SHARE OF rv",
            )
            .bind(&target_types)
            .bind(&target_ids)
            .fetch_all(&mut **tx)
            .await
            .map_err(Error::Database)?;

            sqlx::query(
                "INSERT INTO search_reference
                    (resource_type, resource_id, parameter_path, target_type, target_id, source_partition)
                 SELECT $1, $2, r.path, r.target_type, r.target_id, $3
                 FROM unnest($4::text[], $5::text[], $6::text[]) AS r(path, target_type, target_id)
                 ON CONFLICT DO NOTHING",
            )
            .bind(&key.resource_type)
            .bind(&key.id)
            .bind(stored.partition.as_str())
            .bind(&paths)
            .bind(&target_types)
            .bind(&target_ids)
            .execute(&mut **tx)
            .await
            .map_err(Error::Database)?;
        }

        sqlx::query(
            "INSERT INTO search_date (resource_type, resource_id, parameter_name, value)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (resource_type, resource_id, parameter_name)
             DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(&key.resource_type)
        .bind(&key.id)
        .bind(LAST_UPDATED_PARAM)
        .bind(stored.last_updated)
        .execute(&mut **tx)
        .await
        .map_err(Error::Database)?;

        Ok(())
    }
}

#[async_trait]
impl ResourceStore for PostgresResourceStore {
    async fn create(&self, mut resource: JsonValue, partition: PartitionId) -> Result<StoredResource> {
        let (resource_type, id) = resource_identity(&resource)?;
        let id = id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let key = ResourceKey::new(resource_type, id);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let inserted = sqlx::query(
            "INSERT INTO resource_versions (resource_type, id, next_version, partition_id)
             VALUES ($1, $2, 1, $3)
             ON CONFLICT (resource_type, id) DO NOTHING",
        )
        .bind(&key.resource_type)
        .bind(&key.id)
        .bind(partition.as_str())
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        if inserted == 0 {
            return Err(Error::Validation(format!("Resource {} already exists", key)));
        }

        let now = Utc::now();
        stamp_meta(&mut resource, &key.id, 1, now);
        let stored = StoredResource {
            key,
            version_id: 1,
            partition,
            resource,
            last_updated: now,
        };

        Self::insert_version(&mut tx, &stored).await?;
        Self::write_index_rows(&mut tx, &stored).await?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(stored)
    }

    async fn update(&self, mut resource: JsonValue) -> Result<StoredResource> {
        let (resource_type, id) = resource_identity(&resource)?;
        let id = id.ok_or_else(|| Error::InvalidResource("Missing id field".to_string()))?;
        let key = ResourceKey::new(resource_type, id);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let version_row = sqlx::query(
            "UPDATE resource_versions
             SET next_version = next_version + 1
             WHERE resource_type = $1 AND id = $2
             RETURNING next_version, partition_id",
        )
        .bind(&key.resource_type)
        .bind(&key.id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(Error::Database)?
        .ok_or_else(|| Error::ResourceNotFound {
            resource_type: key.resource_type.clone(),
            id: key.id.clone(),
        })?;

        let version_id: i32 = version_row.get("next_version");
        let partition = PartitionId::new(version_row.get::<String, _>("partition_id"));

        sqlx::query(
            "UPDATE resources SET is_current = false
             WHERE resource_type = $1 AND id = $2 AND is_current = true",
        )
        .bind(&key.resource_type)
        .bind(&key.id)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let now = Utc::now();
        stamp_meta(&mut resource, &key.id, version_id, now);
        let stored = StoredResource {
            key,
            version_id,
            partition,
            resource,
            last_updated: now,
        };

        Self::insert_version(&mut tx, &stored).await?;
        Self::write_index_rows(&mut tx, &stored).await?;
        tx.commit().await.map_err(Error::Database)?;

        Ok(stored)
    }

    async fn read(&self, key: &ResourceKey) -> Result<Option<StoredResource>> {
        let row = sqlx::query(
            "SELECT resource_type, id, version_id, partition_id, resource, last_updated
             FROM resources
             WHERE resource_type = $1 AND id = $2 AND is_current = true",
        )
        .bind(&key.resource_type)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(row.as_ref().map(Self::row_to_resource))
    }

    async fn count(&self, resource_type: &str) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM resource_versions WHERE resource_type = $1")
                .bind(resource_type)
                .fetch_one(&self.pool)
                .await
                .map_err(Error::Database)?;
        Ok(count.max(0) as u64)
    }

    async fn find_candidates(
        &self,
        criteria: &SearchCriteria,
        partition: &RequestPartition,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<ResourceKey>> {
        let partitions: Option<Vec<String>> = match partition {
            RequestPartition::All => None,
            RequestPartition::Only(ids) => {
                Some(ids.iter().map(|p| p.as_str().to_string()).collect())
            }
        };

        let rows = sqlx::query(
            "SELECT resource_type, id
             FROM resources
             WHERE resource_type = $1
               AND is_current = true
               AND ($2::text[] IS NULL OR id = ANY($2))
               AND ($3::text[] IS NULL OR partition_id = ANY($3))
             ORDER BY id
             OFFSET $4
             LIMIT $5",
        )
        .bind(&criteria.resource_type)
        .bind(&criteria.ids)
        .bind(partitions)
        .bind(offset as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows
            .into_iter()
            .map(|row| ResourceKey::new(row.get::<String, _>("resource_type"), row.get::<String, _>("id")))
            .collect())
    }

    async fn incoming_links(&self, targets: &[ResourceKey]) -> Result<Vec<ReferenceLink>> {
        if targets.is_empty() {
            return Ok(Vec::new());
        }
        let (types, ids) = Self::split_keys(targets);

        let rows = sqlx::query(
            "SELECT sr.resource_type, sr.resource_id, sr.parameter_path,
                    sr.target_type, sr.target_id, sr.source_partition
             FROM search_reference sr
             JOIN unnest($1::text[], $2::text[]) AS t(target_type, target_id)
               ON sr.target_type = t.target_type AND sr.target_id = t.target_id",
        )
        .bind(&types)
        .bind(&ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::row_to_link).collect())
    }

    async fn outgoing_links(&self, source: &ResourceKey) -> Result<Vec<ReferenceLink>> {
        let rows = sqlx::query(
            "SELECT resource_type, resource_id, parameter_path, target_type, target_id, source_partition
             FROM search_reference
             WHERE resource_type = $1 AND resource_id = $2
             ORDER BY parameter_path, target_type, target_id",
        )
        .bind(&source.resource_type)
        .bind(&source.id)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;

        Ok(rows.iter().map(Self::row_to_link).collect())
    }

    async fn expunge_batch(
        &self,
        keys: &[ResourceKey],
        allowed_referrers: &HashSet<ResourceKey>,
    ) -> Result<BatchCounts> {
        if keys.is_empty() {
            return Ok(BatchCounts::default());
        }
        let (types, ids) = Self::split_keys(keys);
        let (allowed_types, allowed_ids) = Self::split_keys(allowed_referrers);

        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        // Lock the batch so writers to these resources, and writers of links to them, wait
        // for the commit.
        sqlx::query(
            "SELECT 1 FROM resource_versions rv
             JOIN unnest($1::text[], $2::text[]) AS b(resource_type, id)
               ON rv.resource_type = b.resource_type AND rv.id = b.id
             ORDER BY rv.resource_type, rv.id
             FOR UPDATE OF rv",
        )
        .bind(&types)
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;

        let outside = sqlx::query(OUTSIDE_REFERRER_SQL)
            .bind(&types)
            .bind(&ids)
            .bind(&allowed_types)
            .bind(&allowed_ids)
            .fetch_optional(&mut *tx)
            .await
            .map_err(Error::Database)?;

        if let Some(row) = outside {
            let conflict = Conflict {
                target: ResourceKey::new(
                    row.get::<String, _>("target_type"),
                    row.get::<String, _>("target_id"),
                ),
                referrer: ResourceKey::new(
                    row.get::<String, _>("resource_type"),
                    row.get::<String, _>("resource_id"),
                ),
                path: row.get("parameter_path"),
            };
            return Err(conflict.into());
        }

        let mut entities = 0u64;

        entities += sqlx::query(
            "DELETE FROM search_reference sr
             USING unnest($1::text[], $2::text[]) AS b(resource_type, id)
             WHERE (sr.resource_type = b.resource_type AND sr.resource_id = b.id)
                OR (sr.target_type = b.resource_type AND sr.target_id = b.id)",
        )
        .bind(&types)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        entities += sqlx::query(
            "DELETE FROM search_date sd
             USING unnest($1::text[], $2::text[]) AS b(resource_type, id)
             WHERE sd.resource_type = b.resource_type AND sd.resource_id = b.id",
        )
        .bind(&types)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        entities += sqlx::query(
            "DELETE FROM resources r
             USING unnest($1::text[], $2::text[]) AS b(resource_type, id)
             WHERE r.resource_type = b.resource_type AND r.id = b.id",
        )
        .bind(&types)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        let resources = sqlx::query(
            "DELETE FROM resource_versions rv
             USING unnest($1::text[], $2::text[]) AS b(resource_type, id)
             WHERE rv.resource_type = b.resource_type AND rv.id = b.id",
        )
        .bind(&types)
        .bind(&ids)
        .execute(&mut *tx)
        .await
        .map_err(Error::Database)?
        .rows_affected();

        tx.commit().await.map_err(Error::Database)?;

        Ok(BatchCounts {
            resources_expunged: resources,
            entities_expunged: entities + resources,
        })
    }
}
