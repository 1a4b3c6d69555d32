use serde::{Deserialize, Serialize};

/// Content-addressed document ID (blake3 hex hash).
pub type DocId = String;

/// Document metadata stored alongside content in cnidarium.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: DocId,
    pub original_name: String,
    /// e.g. "upload:site-plan.pdf" or "url:https://..."
    pub source: String,
    /// Library grouping, e.g. "swppp", "permit", "reference"
    pub category: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content_type: Option<String>,
    pub file_size: usize,
    pub uploaded_at: i64,
}

/// A stored document with its extracted text.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub id: DocId,
    pub original_name: String,
    pub content: String,
    pub category: String,
    pub description: Option<String>,
    pub uploaded_at: i64,
    pub file_size: usize,
}

impl SourceDocument {
    pub fn from_parts(meta: DocumentMeta, content: String) -> Self {
        Self {
            id: meta.id,
            original_name: meta.original_name,
            content,
            category: meta.category,
            description: meta.description,
            uploaded_at: meta.uploaded_at,
            file_size: meta.file_size,
        }
    }

    /// Length of the extracted text in characters (not bytes).
    pub fn char_count(&self) -> usize {
        self.content.chars().count()
    }
}

/// How an analysis record was produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum AnalysisMode {
    Model,
    Fallback(String),
    Calculation,
}

impl AnalysisMode {
    pub fn is_fallback(&self) -> bool {
        matches!(self, AnalysisMode::Fallback(_))
    }
}

/// A persisted analysis run against one document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRecord {
    pub id: String,
    pub document_id: DocId,
    #[serde(default)]
    pub query: Option<String>,
    pub analysis: String,
    pub insights: Vec<String>,
    pub mode: AnalysisMode,
    pub created_at: i64,
}

/// A recommendation persisted as a child record of its source document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecommendation {
    pub document_id: DocId,
    pub analysis_id: String,
    pub title: String,
    pub content: String,
    pub category: String,
    #[serde(default)]
    pub subcategory: Option<String>,
    pub citation: String,
    pub created_at: i64,
}
