//! In-memory stage store.

use super::{ArtifactArea, Result, StageStateStore};
use stagegate_core::{RunId, Stage, StageRecord, ValidationResult, WorkItem, WorkItemId};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

/// In-memory store for tests and embedding. Not durable; artifact
/// directories still live on disk under the given root.
#[derive(Debug)]
pub struct MemoryStageStore {
    artifact_root: PathBuf,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    items: BTreeMap<WorkItemId, WorkItem>,
    records: BTreeMap<(WorkItemId, Stage), StageRecord>,
    validations: BTreeMap<(WorkItemId, RunId), ValidationResult>,
}

impl MemoryStageStore {
    /// Create an empty store whose artifacts go under `artifact_root`.
    pub fn new(artifact_root: impl Into<PathBuf>) -> Self {
        Self {
            artifact_root: artifact_root.into(),
            inner: Mutex::new(Inner::default()),
        }
    }
}

#[async_trait::async_trait]
impl StageStateStore for MemoryStageStore {
    async fn save_work_item(&self, item: &WorkItem) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.items.insert(item.id.clone(), item.clone());
        Ok(())
    }

    async fn load_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>> {
        Ok(self.inner.lock().await.items.get(id).cloned())
    }

    async fn list_work_items(&self) -> Result<Vec<WorkItemId>> {
        Ok(self.inner.lock().await.items.keys().cloned().collect())
    }

    async fn save_record(&self, record: &StageRecord) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .records
            .insert((record.work_item.clone(), record.stage), record.clone());
        Ok(())
    }

    async fn load_record(&self, id: &WorkItemId, stage: Stage) -> Result<Option<StageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner.records.get(&(id.clone(), stage)).cloned())
    }

    async fn load_records(&self, id: &WorkItemId) -> Result<Vec<StageRecord>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .records
            .range((id.clone(), Stage::MetadataGeneration)..=(id.clone(), Stage::ArtifactGeneration))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn save_validation(&self, result: &ValidationResult) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner
            .validations
            .insert((result.work_item.clone(), result.run_id), result.clone());
        Ok(())
    }

    async fn load_validation(
        &self,
        id: &WorkItemId,
        run_id: &RunId,
    ) -> Result<Option<ValidationResult>> {
        let inner = self.inner.lock().await;
        Ok(inner.validations.get(&(id.clone(), *run_id)).cloned())
    }

    async fn artifact_dir(&self, id: &WorkItemId, area: ArtifactArea) -> Result<PathBuf> {
        let dir = self.artifact_root.join(id.as_str()).join(area.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_core::StageStatus;

    fn id(s: &str) -> WorkItemId {
        WorkItemId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_records_are_scoped_per_item_and_ordered() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MemoryStageStore::new(dir.path());
        for stage in [Stage::ArtifactGeneration, Stage::MetadataGeneration] {
            store
                .save_record(&StageRecord::pending(id("a"), stage))
                .await
                .unwrap();
        }
        store
            .save_record(&StageRecord::pending(id("b"), Stage::ContentFinalization))
            .await
            .unwrap();

        let records = store.load_records(&id("a")).await.unwrap();
        let stages: Vec<_> = records.iter().map(|r| r.stage).collect();
        assert_eq!(stages, vec![Stage::MetadataGeneration, Stage::ArtifactGeneration]);
        assert_eq!(store.load_records(&id("b")).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_replaces_record() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MemoryStageStore::new(dir.path());
        let mut record = StageRecord::pending(id("a"), Stage::MetadataGeneration);
        store.save_record(&record).await.unwrap();
        record.transition(StageStatus::Running).unwrap();
        store.save_record(&record).await.unwrap();

        let loaded = store
            .load_record(&id("a"), Stage::MetadataGeneration)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.status, StageStatus::Running);
    }
}
