//! Work item model - the unit under validation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::id::WorkItemId;
use crate::Time;

/// Content type tag (`markdown`, `latex`, `pdf`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentType(String);

impl ContentType {
    /// Create a content type tag. Tags are lowercase.
    pub fn new(tag: impl AsRef<str>) -> Self {
        Self(tag.as_ref().trim().to_lowercase())
    }

    /// Guess the content type from a file extension.
    pub fn from_extension(ext: &str) -> Self {
        let ext = ext.to_lowercase();
        let tag = match ext.as_str() {
            "md" | "markdown" => "markdown",
            "tex" | "ltx" => "latex",
            "txt" => "text",
            "htm" | "html" => "html",
            "yml" | "yaml" => "yaml",
            "rs" => "rust",
            "py" => "python",
            other => other,
        };
        Self::new(tag)
    }

    /// Guess the content type from a path, if it has an extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
    }

    /// Wildcard accepted by validators that handle any content.
    pub fn any() -> Self {
        Self("*".to_string())
    }

    /// Whether this is the wildcard.
    pub fn is_any(&self) -> bool {
        self.0 == "*"
    }

    /// Borrow the tag.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An "original vs. final" artifact pair supplied by an upstream caller so a
/// reviewer can compare them without re-running anything.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComparisonArtifact {
    /// What is being compared
    pub label: String,

    /// Original version
    pub original: PathBuf,

    /// Final version
    #[serde(rename = "final")]
    pub revised: PathBuf,
}

/// Errors that make a work item unusable for validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkItemError {
    /// Identifier is not acceptable
    #[error(transparent)]
    InvalidId(#[from] crate::id::InvalidIdError),

    /// No content reference
    #[error("work item '{0}' has an empty content reference")]
    EmptyRoot(WorkItemId),

    /// Nothing declares what kind of content this is
    #[error("work item '{0}' declares no content types")]
    NoContentTypes(WorkItemId),
}

/// A text file read from a work item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocument {
    /// Path relative to the work item root (the file name when root is a file)
    pub path: String,

    /// Full text
    pub text: String,
}

/// The unit under validation: a manuscript, a change set, a stage output.
///
/// A work item is never mutated once a stage has started working on it;
/// stages produce a new revision with [`WorkItem::next_revision`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier, shared by all revisions
    pub id: WorkItemId,

    /// Revision number, starting at 0
    pub revision: u32,

    /// Root content reference (file or directory)
    pub root: PathBuf,

    /// Content types present
    pub content_types: BTreeSet<ContentType>,

    /// Arbitrary metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,

    /// Comparison artifacts for reviewers
    #[serde(default)]
    pub comparisons: Vec<ComparisonArtifact>,

    /// Creation timestamp of this revision
    pub created_at: Time,
}

impl WorkItem {
    /// Create revision 0 of a work item. The content type is inferred from
    /// the root's extension when it has one.
    pub fn new(id: WorkItemId, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let content_types = ContentType::from_path(&root).into_iter().collect();
        Self {
            id,
            revision: 0,
            root,
            content_types,
            metadata: BTreeMap::new(),
            comparisons: Vec::new(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Declare an additional content type.
    pub fn with_content_type(mut self, content_type: ContentType) -> Self {
        self.content_types.insert(content_type);
        self
    }

    /// Attach a metadata value.
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Attach a comparison artifact.
    pub fn with_comparison(mut self, comparison: ComparisonArtifact) -> Self {
        self.comparisons.push(comparison);
        self
    }

    /// Check the item is usable for validation.
    pub fn validate(&self) -> Result<(), WorkItemError> {
        if !WorkItemId::is_valid(self.id.as_str()) {
            return Err(crate::id::InvalidIdError(self.id.to_string()).into());
        }
        if self.root.as_os_str().is_empty() {
            return Err(WorkItemError::EmptyRoot(self.id.clone()));
        }
        if self.content_types.is_empty() {
            return Err(WorkItemError::NoContentTypes(self.id.clone()));
        }
        Ok(())
    }

    /// Produce the revision handed to the next stage. Metadata and comparison
    /// artifacts carry over; `metadata` entries are merged on top.
    pub fn next_revision(
        &self,
        root: impl Into<PathBuf>,
        content_types: BTreeSet<ContentType>,
        metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        let mut merged = self.metadata.clone();
        merged.extend(metadata);
        Self {
            id: self.id.clone(),
            revision: self.revision + 1,
            root: root.into(),
            content_types,
            metadata: merged,
            comparisons: self.comparisons.clone(),
            created_at: chrono::Utc::now(),
        }
    }

    /// Whether any declared content type is in `supported` (or `supported`
    /// holds the wildcard).
    pub fn has_any_type(&self, supported: &BTreeSet<ContentType>) -> bool {
        supported.iter().any(ContentType::is_any)
            || self.content_types.iter().any(|t| supported.contains(t))
    }

    /// Read every UTF-8 text file under the root, sorted by path.
    ///
    /// Binary files (anything that is not valid UTF-8) are skipped.
    pub async fn read_text(&self) -> std::io::Result<Vec<TextDocument>> {
        let meta = tokio::fs::metadata(&self.root).await?;
        if meta.is_file() {
            let name = self
                .root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let bytes = tokio::fs::read(&self.root).await?;
            return Ok(String::from_utf8(bytes)
                .map(|text| vec![TextDocument { path: name, text }])
                .unwrap_or_default());
        }

        let mut docs = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut rd = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                let path = entry.path();
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let bytes = tokio::fs::read(&path).await?;
                    if let Ok(text) = String::from_utf8(bytes) {
                        let rel = path
                            .strip_prefix(&self.root)
                            .unwrap_or(&path)
                            .to_string_lossy()
                            .replace('\\', "/");
                        docs.push(TextDocument { path: rel, text });
                    }
                }
            }
        }
        docs.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> WorkItemId {
        WorkItemId::new(s).unwrap()
    }

    #[test]
    fn test_content_type_inferred_from_extension() {
        let item = WorkItem::new(id("book"), "drafts/book.md");
        assert!(item.content_types.contains(&ContentType::new("markdown")));
        assert_eq!(ContentType::from_extension("TEX").as_str(), "latex");
    }

    #[test]
    fn test_wildcard_supports_everything() {
        let item = WorkItem::new(id("book"), "book.tex");
        let any: BTreeSet<_> = [ContentType::any()].into_iter().collect();
        let md: BTreeSet<_> = [ContentType::new("markdown")].into_iter().collect();
        assert!(item.has_any_type(&any));
        assert!(!item.has_any_type(&md));
    }

    #[test]
    fn test_validate_requires_content_types() {
        let item = WorkItem::new(id("book"), "drafts");
        assert_eq!(
            item.validate(),
            Err(WorkItemError::NoContentTypes(id("book")))
        );
        let item = item.with_content_type(ContentType::new("markdown"));
        assert!(item.validate().is_ok());
    }

    #[test]
    fn test_next_revision_merges_metadata() {
        let item = WorkItem::new(id("book"), "book.md")
            .with_metadata("author", serde_json::json!("Ada"));
        let mut extra = BTreeMap::new();
        extra.insert("title".to_string(), serde_json::json!("Notes"));
        let types: BTreeSet<_> = [ContentType::new("latex")].into_iter().collect();

        let next = item.next_revision("out/book.tex", types, extra);
        assert_eq!(next.revision, 1);
        assert_eq!(next.id, item.id);
        assert_eq!(next.metadata.len(), 2);
        assert_eq!(item.revision, 0);
    }

    #[tokio::test]
    async fn test_read_text_walks_directory_sorted() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("b.md"), "beta").await.unwrap();
        tokio::fs::write(dir.path().join("sub/a.md"), "alpha").await.unwrap();
        tokio::fs::write(dir.path().join("img.bin"), [0xff, 0xfe, 0x00])
            .await
            .unwrap();

        let item = WorkItem::new(id("dir"), dir.path());
        let docs = item.read_text().await.unwrap();
        let paths: Vec<_> = docs.iter().map(|d| d.path.as_str()).collect();
        assert_eq!(paths, vec!["b.md", "sub/a.md"]);
    }
}
