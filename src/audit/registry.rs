//! Partition Registry
//!
//! Cached view of `audit_partitions`. Every change to that table bumps a
//! generation counter in the same transaction, so the cache is checked with
//! one small query and reloaded only when some writer (in this process or
//! another) has archived since. Readers that touch more than one store take
//! a [`PartitionSet`] snapshot and confirm it is still current afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::database::models::PartitionMetadata;
use crate::database::queries::Queries;
use crate::database::Database;
use crate::error::AuditResult;

/// Partitions as of one generation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PartitionSet {
    generation: i64,
    partitions: BTreeMap<i32, PartitionMetadata>,
}

impl PartitionSet {
    fn new(generation: i64, partitions: Vec<PartitionMetadata>) -> Self {
        Self {
            generation,
            partitions: partitions
                .into_iter()
                .map(|meta| (meta.partition_key, meta))
                .collect(),
        }
    }

    pub fn generation(&self) -> i64 {
        self.generation
    }

    /// Ascending key (and therefore id) order.
    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &PartitionMetadata> {
        self.partitions.values()
    }

    pub fn get(&self, key: i32) -> Option<&PartitionMetadata> {
        self.partitions.get(&key)
    }

    /// Partition whose committed id range contains `id`.
    pub fn containing(&self, id: i64) -> Option<&PartitionMetadata> {
        self.iter().find(|meta| meta.contains(id))
    }

    /// Boundary digest of the partition whose last entry is `id - 1`.
    pub fn boundary_before(&self, id: i64) -> Option<&str> {
        self.iter()
            .find(|meta| meta.last_id == Some(id - 1))
            .and_then(|meta| meta.boundary_digest.as_deref())
    }

    /// Highest id committed to any partition.
    pub fn last_archived_id(&self) -> Option<i64> {
        self.iter().filter_map(|meta| meta.last_id).max()
    }

    pub fn total_archived(&self) -> u64 {
        self.iter().map(|meta| meta.row_count).sum()
    }
}

#[derive(Clone, Debug)]
pub struct PartitionRegistry {
    db: Database,
    current: Arc<RwLock<Arc<PartitionSet>>>,
}

impl PartitionRegistry {
    pub async fn load(db: &Database) -> AuditResult<Self> {
        let registry = Self {
            db: db.clone(),
            current: Arc::new(RwLock::new(Arc::new(PartitionSet::default()))),
        };
        let set = registry.reload().await?;
        info!(
            generation = set.generation(),
            "Loaded {} archive partitions",
            set.partitions.len()
        );
        Ok(registry)
    }

    /// Partitions as currently committed in the database.
    pub async fn snapshot(&self) -> AuditResult<Arc<PartitionSet>> {
        let generation = self.stored_generation().await?;
        {
            let cached = self.current.read().await;
            if cached.generation == generation {
                return Ok(cached.clone());
            }
        }
        self.reload().await
    }

    /// Whether no partition change has committed since `set` was taken.
    pub async fn is_current(&self, set: &PartitionSet) -> AuditResult<bool> {
        Ok(self.stored_generation().await? == set.generation)
    }

    pub async fn get(&self, key: i32) -> AuditResult<Option<PartitionMetadata>> {
        Ok(self.snapshot().await?.get(key).cloned())
    }

    pub async fn all(&self) -> AuditResult<Vec<PartitionMetadata>> {
        Ok(self.snapshot().await?.iter().cloned().collect())
    }

    pub async fn last_archived_id(&self) -> AuditResult<Option<i64>> {
        Ok(self.snapshot().await?.last_archived_id())
    }

    async fn stored_generation(&self) -> AuditResult<i64> {
        let mut conn = self.db.pool().acquire().await?;
        Queries::partition_generation(&mut conn).await
    }

    /// Generation and rows are read in one transaction so the set is never
    /// labelled with a generation it does not belong to.
    async fn reload(&self) -> AuditResult<Arc<PartitionSet>> {
        let mut tx = self.db.pool().begin().await?;
        let generation = Queries::partition_generation(&mut tx).await?;
        let partitions = Queries::load_partitions(&mut tx).await?;
        tx.commit().await?;

        let set = Arc::new(PartitionSet::new(generation, partitions));
        let mut current = self.current.write().await;
        if set.generation >= current.generation {
            *current = set.clone();
        }
        debug!(generation = set.generation, "Reloaded partition registry");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn meta(key: i32, first: i64, last: i64) -> PartitionMetadata {
        PartitionMetadata {
            partition_key: key,
            first_id: Some(first),
            last_id: Some(last),
            row_count: (last - first + 1) as u64,
            boundary_digest: Some(format!("sha256:boundary-{}", key)),
            storage_location: format!("audit_archive_{}", key),
            created_at: Utc::now(),
            sealed_at: Some(Utc::now()),
        }
    }

    #[test]
    fn test_lookup() {
        let set = PartitionSet::new(3, vec![meta(2023, 1, 5), meta(2022, 0, 0)]);

        assert_eq!(set.containing(3).unwrap().partition_key, 2023);
        assert!(set.containing(6).is_none());
        assert_eq!(set.boundary_before(6), Some("sha256:boundary-2023"));
        assert_eq!(set.last_archived_id(), Some(5));
        assert_eq!(set.iter().next().unwrap().partition_key, 2022);
        assert_eq!(set.total_archived(), 6);
    }

    #[tokio::test]
    async fn test_load_empty() {
        let db = Database::new_in_memory().await.unwrap();
        let registry = PartitionRegistry::load(&db).await.unwrap();
        let set = registry.snapshot().await.unwrap();
        assert_eq!(set.generation(), 0);
        assert_eq!(set.iter().count(), 0);
    }

    #[tokio::test]
    async fn test_reloads_after_external_change() {
        let db = Database::new_in_memory().await.unwrap();
        let registry = PartitionRegistry::load(&db).await.unwrap();
        let before = registry.snapshot().await.unwrap();

        // another writer records a partition behind the registry's back
        let mut tx = db.pool().begin().await.unwrap();
        Queries::insert_partition(&mut tx, &meta(2023, 1, 5)).await.unwrap();
        Queries::bump_partition_generation(&mut tx).await.unwrap();
        tx.commit().await.unwrap();

        assert!(!registry.is_current(&before).await.unwrap());
        let after = registry.snapshot().await.unwrap();
        assert_eq!(after.generation(), 1);
        assert_eq!(after.get(2023).unwrap().last_id, Some(5));
        assert!(registry.is_current(&after).await.unwrap());
    }
}
