//! Document snapshots: the read-only input to the chunk codec
//!
//! A snapshot is an ordered tree of chapters, sections and content blocks.
//! Block kinds are explicit variants; anything the codec does not know about
//! is carried verbatim in [`Block::Other`] so newer producers do not break
//! older builders.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{BundlecastError, Result};
use crate::types::DocumentId;

/// Point-in-time view of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentSnapshot {
    /// Taken from the file name when a directory snapshot leaves it out
    #[serde(default)]
    pub document_id: DocumentId,
    #[serde(default)]
    pub title: String,
    /// Editorial revision of the source document, informational only
    pub revision: Option<String>,
    #[serde(default)]
    pub chapters: Vec<Chapter>,
}

/// Top-level structural unit; chunk boundaries always fall between chapters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chapter {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub sections: Vec<Section>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsections: Vec<Section>,
}

/// Content node. Unknown `type` tags deserialize into [`Block::Other`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Block {
    Known(KnownBlock),
    Other(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KnownBlock {
    Paragraph {
        text: String,
    },
    Heading {
        level: u8,
        text: String,
    },
    List {
        #[serde(default)]
        ordered: bool,
        items: Vec<String>,
    },
    CodeBlock {
        language: Option<String>,
        code: String,
    },
    Table {
        #[serde(default)]
        header: Vec<String>,
        rows: Vec<Vec<String>>,
    },
    Image {
        src: String,
        alt: Option<String>,
    },
    Note {
        severity: Option<String>,
        text: String,
    },
}

impl Block {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Block::Known(KnownBlock::Paragraph { text: text.into() })
    }

    pub fn is_known(&self) -> bool {
        matches!(self, Block::Known(_))
    }
}

/// Document snapshot collaborator
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    /// Materialize the current content of a document
    async fn snapshot(&self, document_id: &str) -> Result<DocumentSnapshot>;
}

/// Reads `<root>/<document_id>.json` files
pub struct DirectorySnapshotSource {
    root: PathBuf,
}

impl DirectorySnapshotSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, document_id: &str) -> Result<PathBuf> {
        if document_id.is_empty()
            || document_id.contains('/')
            || document_id.contains('\\')
            || document_id.contains("..")
        {
            return Err(BundlecastError::InvalidInput(format!(
                "Invalid document id: {}",
                document_id
            )));
        }
        Ok(self.root.join(format!("{}.json", document_id)))
    }
}

#[async_trait]
impl SnapshotSource for DirectorySnapshotSource {
    async fn snapshot(&self, document_id: &str) -> Result<DocumentSnapshot> {
        let path = self.path_for(document_id)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundlecastError::not_found("document", document_id));
            }
            Err(e) => return Err(e.into()),
        };
        let mut snapshot: DocumentSnapshot = serde_json::from_slice(&raw)
            .map_err(|e| BundlecastError::Snapshot(format!("{}: {}", path.display(), e)))?;
        if snapshot.document_id.is_empty() {
            snapshot.document_id = document_id.to_string();
        }
        if snapshot.document_id != document_id {
            return Err(BundlecastError::Snapshot(format!(
                "{} contains document {}",
                path.display(),
                snapshot.document_id
            )));
        }
        Ok(snapshot)
    }
}

/// In-process snapshot source, fed by whoever owns document editing
#[derive(Default)]
pub struct MemorySnapshotSource {
    documents: DashMap<DocumentId, DocumentSnapshot>,
}

impl MemorySnapshotSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, snapshot: DocumentSnapshot) {
        self.documents
            .insert(snapshot.document_id.clone(), snapshot);
    }

    pub fn remove(&self, document_id: &str) {
        self.documents.remove(document_id);
    }
}

#[async_trait]
impl SnapshotSource for MemorySnapshotSource {
    async fn snapshot(&self, document_id: &str) -> Result<DocumentSnapshot> {
        self.documents
            .get(document_id)
            .map(|s| s.clone())
            .ok_or_else(|| BundlecastError::not_found("document", document_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_block_kept_verbatim() {
        let json = r#"[
            {"type": "paragraph", "text": "Torque to 25 Nm."},
            {"type": "wiring_diagram", "svg": "<svg/>", "revision": 3}
        ]"#;
        let blocks: Vec<Block> = serde_json::from_str(json).unwrap();
        assert!(blocks[0].is_known());
        match &blocks[1] {
            Block::Other(value) => {
                assert_eq!(value["type"], "wiring_diagram");
                assert_eq!(value["revision"], 3);
            }
            other => panic!("expected Other, got {:?}", other),
        }

        let back = serde_json::to_value(&blocks).unwrap();
        assert_eq!(back[1]["svg"], "<svg/>");
        assert_eq!(back[0]["type"], "paragraph");
    }

    #[tokio::test]
    async fn test_directory_source() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("manual-1.json"),
            r#"{"title": "Pump", "chapters": [{"id": "c1", "sections": []}]}"#,
        )
        .unwrap();

        let source = DirectorySnapshotSource::new(dir.path());
        let snapshot = source.snapshot("manual-1").await.unwrap();
        assert_eq!(snapshot.document_id, "manual-1");
        assert_eq!(snapshot.chapters.len(), 1);

        std::fs::write(
            dir.path().join("manual-2.json"),
            r#"{"documentId": "manual-3", "chapters": []}"#,
        )
        .unwrap();
        assert!(matches!(
            source.snapshot("manual-2").await,
            Err(BundlecastError::Snapshot(_))
        ));

        assert!(source.snapshot("missing").await.unwrap_err().is_not_found());
        assert!(matches!(
            source.snapshot("../etc/passwd").await,
            Err(BundlecastError::InvalidInput(_))
        ));
    }
}
