//! JSON file stage store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<work-item>/work_item.json
//! <root>/<work-item>/stages/<stage>.json
//! <root>/<work-item>/validations/<run-id>.json
//! <root>/<work-item>/{outputs,reports,review}/
//! ```
//!
//! Every document is written to a temporary sibling and renamed into place,
//! so a crash never leaves a half-written record behind.

use super::{ArtifactArea, Result, StageStateStore, StorageError};
use stagegate_core::{RunId, Stage, StageRecord, ValidationResult, WorkItem, WorkItemId};
use std::path::{Path, PathBuf};
use tokio::fs;

/// File-based JSON stage store.
#[derive(Debug, Clone)]
pub struct JsonStageStore {
    root: PathBuf,
}

impl JsonStageStore {
    /// Open (and create if needed) a store rooted at `root`.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    /// Store root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn item_dir(&self, id: &WorkItemId) -> PathBuf {
        self.root.join(id.as_str())
    }

    fn work_item_path(&self, id: &WorkItemId) -> PathBuf {
        self.item_dir(id).join("work_item.json")
    }

    fn record_path(&self, id: &WorkItemId, stage: Stage) -> PathBuf {
        self.item_dir(id)
            .join("stages")
            .join(format!("{}.json", stage.as_str()))
    }

    fn validation_path(&self, id: &WorkItemId, run_id: &RunId) -> PathBuf {
        self.item_dir(id)
            .join("validations")
            .join(format!("{}.json", run_id))
    }
}

#[async_trait::async_trait]
impl StageStateStore for JsonStageStore {
    async fn save_work_item(&self, item: &WorkItem) -> Result<()> {
        write_json(&self.work_item_path(&item.id), item).await?;
        tracing::debug!(work_item = %item.id, "Saved work item");
        Ok(())
    }

    async fn load_work_item(&self, id: &WorkItemId) -> Result<Option<WorkItem>> {
        read_json(&self.work_item_path(id)).await
    }

    async fn list_work_items(&self) -> Result<Vec<WorkItemId>> {
        let mut ids = Vec::new();
        let mut rd = fs::read_dir(&self.root).await?;
        while let Some(entry) = rd.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let Ok(id) = WorkItemId::new(name) else {
                continue;
            };
            if fs::try_exists(self.work_item_path(&id)).await? {
                ids.push(id);
            }
        }
        ids.sort();
        Ok(ids)
    }

    async fn save_record(&self, record: &StageRecord) -> Result<()> {
        let path = self.record_path(&record.work_item, record.stage);
        write_json(&path, record).await?;
        tracing::debug!(
            work_item = %record.work_item,
            stage = %record.stage,
            status = %record.status,
            "Saved stage record"
        );
        Ok(())
    }

    async fn load_record(&self, id: &WorkItemId, stage: Stage) -> Result<Option<StageRecord>> {
        let path = self.record_path(id, stage);
        let record: Option<StageRecord> = read_json(&path).await?;
        match record {
            Some(r) if &r.work_item != id || r.stage != stage => Err(StorageError::Corrupt {
                path: path.display().to_string(),
                reason: format!(
                    "record belongs to {}/{}, expected {}/{}",
                    r.work_item, r.stage, id, stage
                ),
            }),
            other => Ok(other),
        }
    }

    async fn load_records(&self, id: &WorkItemId) -> Result<Vec<StageRecord>> {
        let mut records = Vec::new();
        for stage in Stage::ALL {
            if let Some(record) = self.load_record(id, stage).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn save_validation(&self, result: &ValidationResult) -> Result<()> {
        let path = self.validation_path(&result.work_item, &result.run_id);
        write_json(&path, result).await
    }

    async fn load_validation(
        &self,
        id: &WorkItemId,
        run_id: &RunId,
    ) -> Result<Option<ValidationResult>> {
        read_json(&self.validation_path(id, run_id)).await
    }

    async fn artifact_dir(&self, id: &WorkItemId, area: ArtifactArea) -> Result<PathBuf> {
        let dir = self.item_dir(id).join(area.as_str());
        fs::create_dir_all(&dir).await?;
        Ok(dir)
    }
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension(format!("{}.tmp", ulid::Ulid::new()));
    fs::write(&tmp, json.as_bytes()).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read_to_string(path).await {
        Ok(json) => {
            let value = serde_json::from_str(&json).map_err(|e| StorageError::Corrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stagegate_core::StageStatus;
    use tempfile::TempDir;

    fn id(s: &str) -> WorkItemId {
        WorkItemId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = JsonStageStore::new(dir.path()).await.unwrap();
            let mut record = StageRecord::pending(id("book"), Stage::IntermediateConversion);
            record.transition(StageStatus::Running).unwrap();
            record.transition(StageStatus::Failed).unwrap();
            record.error = Some("converter unavailable".into());
            store.save_record(&record).await.unwrap();
            store
                .save_record(&StageRecord::pending(id("book"), Stage::MetadataGeneration))
                .await
                .unwrap();
        }

        let store = JsonStageStore::new(dir.path()).await.unwrap();
        let records = store.load_records(&id("book")).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].stage, Stage::MetadataGeneration);
        assert_eq!(records[1].status, StageStatus::Failed);
        assert_eq!(records[1].error.as_deref(), Some("converter unavailable"));
    }

    #[tokio::test]
    async fn test_missing_record_is_none() {
        let dir = TempDir::new().unwrap();
        let store = JsonStageStore::new(dir.path()).await.unwrap();
        let record = store
            .load_record(&id("nothing"), Stage::ArtifactGeneration)
            .await
            .unwrap();
        assert!(record.is_none());
        assert!(store.load_records(&id("nothing")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = JsonStageStore::new(dir.path()).await.unwrap();
        let path = dir.path().join("book/stages/metadata-generation.json");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{ not json").unwrap();

        let err = store
            .load_record(&id("book"), Stage::MetadataGeneration)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Corrupt { .. }));
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = JsonStageStore::new(dir.path()).await.unwrap();
        let item = WorkItem::new(id("book"), "book.md");
        store.save_work_item(&item).await.unwrap();
        store.save_work_item(&item).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path().join("book"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["work_item.json"]);
        assert_eq!(store.list_work_items().await.unwrap(), vec![id("book")]);
    }

    #[tokio::test]
    async fn test_artifact_dir_is_created() {
        let dir = TempDir::new().unwrap();
        let store = JsonStageStore::new(dir.path()).await.unwrap();
        let reports = store
            .artifact_dir(&id("book"), ArtifactArea::Reports)
            .await
            .unwrap();
        assert!(reports.is_dir());
        assert!(reports.ends_with("book/reports"));
    }
}
