pub mod ingest;
pub mod types;

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use cnidarium::{StateDelta, StateRead, StateWrite, Storage};
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use types::{AnalysisRecord, DocId, DocumentMeta, SourceDocument, StoredRecommendation};

// Key prefixes (no trailing slashes, cnidarium convention)
const CONTENT_PREFIX: &str = "doc/content";
const META_PREFIX: &str = "doc/meta";
const CATEGORY_PREFIX: &str = "doc/category";
const ANALYSIS_PREFIX: &str = "analysis";
const REC_PREFIX: &str = "rec";

fn content_key(id: &str) -> String {
    format!("{}/{}", CONTENT_PREFIX, id)
}
fn meta_key(id: &str) -> String {
    format!("{}/{}", META_PREFIX, id)
}
fn category_key(category: &str, id: &str) -> String {
    format!("{}/{}:{}", CATEGORY_PREFIX, category, id)
}
fn analysis_key(doc_id: &str, analysis_id: &str) -> String {
    format!("{}/{}/{}", ANALYSIS_PREFIX, doc_id, analysis_id)
}
fn rec_key(doc_id: &str, analysis_id: &str, index: usize) -> String {
    format!("{}/{}/{}/{:02}", REC_PREFIX, doc_id, analysis_id, index)
}

/// Fields supplied by the caller when a new document is stored.
#[derive(Debug, Clone, Default)]
pub struct NewDocument<'a> {
    pub original_name: &'a str,
    pub source: &'a str,
    pub category: &'a str,
    pub description: Option<&'a str>,
    pub content_type: Option<&'a str>,
}

pub struct DocumentStore {
    storage: Storage,
    /// Cache document text in memory after first read; the library is re-read on every analysis.
    content_cache: RwLock<HashMap<String, String>>,
}

impl DocumentStore {
    pub async fn new(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;
        let prefixes = vec![
            CONTENT_PREFIX.to_string(),
            META_PREFIX.to_string(),
            CATEGORY_PREFIX.to_string(),
            ANALYSIS_PREFIX.to_string(),
            REC_PREFIX.to_string(),
        ];
        let storage = Storage::load(data_dir.to_path_buf(), prefixes)
            .await
            .context("Failed to init cnidarium storage")?;
        Ok(Self {
            storage,
            content_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Store a document's extracted text. Returns its content-addressed DocId.
    /// Idempotent: same text = same ID.
    pub async fn store(&self, text: &str, file_size: usize, doc: NewDocument<'_>) -> Result<DocId> {
        let id = blake3::hash(text.as_bytes()).to_hex().to_string();

        let meta = DocumentMeta {
            id: id.clone(),
            original_name: doc.original_name.to_string(),
            source: doc.source.to_string(),
            category: doc.category.to_string(),
            description: doc.description.map(|s| s.to_string()),
            content_type: doc.content_type.map(|s| s.to_string()),
            file_size,
            uploaded_at: chrono::Utc::now().timestamp(),
        };

        let snapshot = self.storage.latest_snapshot();
        let previous = match snapshot.get_raw(&meta_key(&id)).await? {
            Some(bytes) => serde_json::from_slice::<DocumentMeta>(&bytes).ok(),
            None => None,
        };
        let mut delta = StateDelta::new(snapshot);

        // Re-uploading under a new category moves the index entry.
        if let Some(prev) = previous.filter(|p| p.category != meta.category) {
            delta.delete(category_key(&prev.category, &id));
        }
        delta.put_raw(content_key(&id), text.as_bytes().to_vec());
        delta.put_raw(
            meta_key(&id),
            serde_json::to_vec(&meta).context("serialize meta")?,
        );
        // Category index entry; presence is the index
        delta.put_raw(category_key(&meta.category, &id), vec![]);

        self.storage.commit(delta).await?;
        debug!(doc_id = %id, name = doc.original_name, category = doc.category, file_size, "document stored");
        Ok(id)
    }

    pub async fn get_content(&self, doc_id: &str) -> Result<String> {
        {
            let cache = self.content_cache.read().await;
            if let Some(content) = cache.get(doc_id) {
                return Ok(content.clone());
            }
        }

        let snapshot = self.storage.latest_snapshot();
        let bytes = snapshot
            .get_raw(&content_key(doc_id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("document not found: {}", doc_id))?;
        let content = String::from_utf8_lossy(&bytes).into_owned();

        {
            let mut cache = self.content_cache.write().await;
            cache.insert(doc_id.to_string(), content.clone());
        }

        Ok(content)
    }

    pub async fn contains(&self, doc_id: &str) -> Result<bool> {
        let snapshot = self.storage.latest_snapshot();
        Ok(snapshot.get_raw(&meta_key(doc_id)).await?.is_some())
    }

    pub async fn get_meta(&self, doc_id: &str) -> Result<DocumentMeta> {
        let snapshot = self.storage.latest_snapshot();
        let bytes = snapshot
            .get_raw(&meta_key(doc_id))
            .await?
            .ok_or_else(|| anyhow::anyhow!("document metadata not found: {}", doc_id))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn get_document(&self, doc_id: &str) -> Result<SourceDocument> {
        let meta = self.get_meta(doc_id).await?;
        let content = self.get_content(doc_id).await?;
        Ok(SourceDocument::from_parts(meta, content))
    }

    /// List all documents, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<DocumentMeta>> {
        let snapshot = self.storage.latest_snapshot();
        let mut stream = snapshot.prefix_raw(META_PREFIX);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((_key, value)) => {
                    if let Ok(meta) = serde_json::from_slice::<DocumentMeta>(&value) {
                        results.push(meta);
                    }
                }
                Err(e) => {
                    warn!("Error reading doc meta stream: {}", e);
                }
            }
        }

        results.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        results.truncate(limit);
        Ok(results)
    }

    /// List documents in a specific category.
    pub async fn list_by_category(&self, category: &str) -> Result<Vec<DocumentMeta>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = format!("{}/{}:", CATEGORY_PREFIX, category);
        let mut stream = snapshot.prefix_raw(&prefix);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((key, _)) => {
                    // Key format: "doc/category/{category}:{doc_id}"
                    if let Some(doc_id) = key.strip_prefix(&prefix) {
                        match self.get_meta(doc_id).await {
                            Ok(meta) => results.push(meta),
                            Err(e) => warn!("Failed to get meta for {}: {}", doc_id, e),
                        }
                    }
                }
                Err(e) => {
                    warn!("Error reading category index: {}", e);
                }
            }
        }

        Ok(results)
    }

    /// Get unique categories for autocomplete.
    pub async fn categories(&self) -> Result<Vec<String>> {
        let snapshot = self.storage.latest_snapshot();
        let mut stream = snapshot.prefix_raw(CATEGORY_PREFIX);
        let mut categories = std::collections::BTreeSet::new();
        let index_prefix = format!("{}/", CATEGORY_PREFIX);

        while let Some(entry) = stream.next().await {
            if let Ok((key, _)) = entry {
                if let Some(rest) = key.strip_prefix(&index_prefix) {
                    if let Some(category) = rest.rsplit_once(':').map(|(c, _)| c) {
                        categories.insert(category.to_string());
                    }
                }
            }
        }

        Ok(categories.into_iter().collect())
    }

    /// Every stored document with its text, in listing order. This is the
    /// reference library consulted by each analysis.
    pub async fn library(&self) -> Result<Vec<SourceDocument>> {
        let metas = self.list(usize::MAX).await?;
        let mut docs = Vec::with_capacity(metas.len());
        for meta in metas {
            match self.get_content(&meta.id).await {
                Ok(content) => docs.push(SourceDocument::from_parts(meta, content)),
                Err(e) => warn!(doc_id = %meta.id, "Skipping library document: {}", e),
            }
        }
        Ok(docs)
    }

    /// Delete a document, its category index, and every dependent record.
    pub async fn delete(&self, doc_id: &str) -> Result<usize> {
        // Fails for unknown ids.
        self.get_meta(doc_id).await?;
        let snapshot = self.storage.latest_snapshot();

        let mut dependents = Vec::new();
        for prefix in [
            format!("{}/{}/", ANALYSIS_PREFIX, doc_id),
            format!("{}/{}/", REC_PREFIX, doc_id),
        ] {
            let mut stream = snapshot.prefix_raw(&prefix);
            while let Some(entry) = stream.next().await {
                match entry {
                    Ok((key, _)) => dependents.push(key),
                    Err(e) => warn!("Error reading dependents of {}: {}", doc_id, e),
                }
            }
        }

        // Every index entry for this id, including any left by older writes.
        let suffix = format!(":{}", doc_id);
        let mut index_keys = Vec::new();
        {
            let mut stream = snapshot.prefix_raw(&format!("{}/", CATEGORY_PREFIX));
            while let Some(entry) = stream.next().await {
                match entry {
                    Ok((key, _)) if key.ends_with(&suffix) => index_keys.push(key),
                    Ok(_) => {}
                    Err(e) => warn!("Error scanning category index for {}: {}", doc_id, e),
                }
            }
        }

        let mut delta = StateDelta::new(snapshot);
        delta.delete(content_key(doc_id));
        delta.delete(meta_key(doc_id));
        for key in index_keys {
            delta.delete(key);
        }
        let dependent_count = dependents.len();
        for key in dependents {
            delta.delete(key);
        }
        self.storage.commit(delta).await?;

        self.content_cache.write().await.remove(doc_id);
        debug!(doc_id, dependent_count, "document deleted");
        Ok(dependent_count)
    }

    /// Persist an analysis record together with its recommendations in one commit.
    pub async fn store_analysis(
        &self,
        record: &AnalysisRecord,
        recommendations: &[StoredRecommendation],
    ) -> Result<()> {
        let snapshot = self.storage.latest_snapshot();
        let mut delta = StateDelta::new(snapshot);
        delta.put_raw(
            analysis_key(&record.document_id, &record.id),
            serde_json::to_vec(record).context("serialize AnalysisRecord")?,
        );
        for (i, rec) in recommendations.iter().enumerate() {
            delta.put_raw(
                rec_key(&rec.document_id, &rec.analysis_id, i),
                serde_json::to_vec(rec).context("serialize StoredRecommendation")?,
            );
        }
        self.storage.commit(delta).await?;
        debug!(
            analysis_id = %record.id,
            doc_id = %record.document_id,
            recommendations = recommendations.len(),
            "analysis stored"
        );
        Ok(())
    }

    /// List analysis records for a document, newest first.
    pub async fn list_analyses(&self, doc_id: &str, limit: usize) -> Result<Vec<AnalysisRecord>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = format!("{}/{}/", ANALYSIS_PREFIX, doc_id);
        let mut stream = snapshot.prefix_raw(&prefix);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((_key, value)) => {
                    if let Ok(record) = serde_json::from_slice::<AnalysisRecord>(&value) {
                        results.push(record);
                    }
                }
                Err(e) => {
                    warn!("Error reading analysis stream: {}", e);
                }
            }
        }

        // v7 ids sort by creation time
        results.sort_by(|a, b| b.id.cmp(&a.id));
        results.truncate(limit);
        Ok(results)
    }

    /// List recommendations for a document, newest analysis first, in extraction order.
    pub async fn list_recommendations(&self, doc_id: &str) -> Result<Vec<StoredRecommendation>> {
        let snapshot = self.storage.latest_snapshot();
        let prefix = format!("{}/{}/", REC_PREFIX, doc_id);
        let mut stream = snapshot.prefix_raw(&prefix);
        let mut results = Vec::new();

        while let Some(entry) = stream.next().await {
            match entry {
                Ok((key, value)) => {
                    if let Ok(rec) = serde_json::from_slice::<StoredRecommendation>(&value) {
                        results.push((key, rec));
                    }
                }
                Err(e) => {
                    warn!("Error reading recommendation stream: {}", e);
                }
            }
        }

        // Key format: "rec/{doc_id}/{analysis_id}/{index:02}"
        results.sort_by(|(ka, a), (kb, b)| b.analysis_id.cmp(&a.analysis_id).then(ka.cmp(kb)));
        Ok(results.into_iter().map(|(_, rec)| rec).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::AnalysisMode;

    fn upload<'a>(name: &'a str, category: &'a str) -> NewDocument<'a> {
        NewDocument {
            original_name: name,
            source: "upload:test",
            category,
            description: None,
            content_type: Some("text/plain"),
        }
    }

    #[tokio::test]
    async fn test_store_is_content_addressed() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();

        let a = store.store("silt fence inspection log", 25, upload("a.txt", "swppp")).await.unwrap();
        let b = store.store("silt fence inspection log", 25, upload("b.txt", "swppp")).await.unwrap();
        assert_eq!(a, b);

        let doc = store.get_document(&a).await.unwrap();
        assert_eq!(doc.content, "silt fence inspection log");
        assert_eq!(doc.category, "swppp");
    }

    #[tokio::test]
    async fn test_delete_cascades_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();
        let id = store
            .store("Grading plan with 3:1 slopes", 28, upload("grading.txt", "site"))
            .await
            .unwrap();

        let record = AnalysisRecord {
            id: "0190-a".to_string(),
            document_id: id.clone(),
            query: None,
            analysis: "Slopes are steep.".to_string(),
            insights: vec!["Steep slopes".to_string()],
            mode: AnalysisMode::Model,
            created_at: 0,
        };
        let rec = StoredRecommendation {
            document_id: id.clone(),
            analysis_id: record.id.clone(),
            title: "Add fiber rolls".to_string(),
            content: "Place along contours".to_string(),
            category: "stormwater".to_string(),
            subcategory: Some("Erosion Control".to_string()),
            citation: "grading.txt, Section 1".to_string(),
            created_at: 0,
        };
        store.store_analysis(&record, &[rec]).await.unwrap();
        assert_eq!(store.list_recommendations(&id).await.unwrap().len(), 1);
        assert_eq!(store.list_analyses(&id, 10).await.unwrap().len(), 1);

        let removed = store.delete(&id).await.unwrap();
        assert_eq!(removed, 2);
        assert!(store.get_meta(&id).await.is_err());
        assert!(store.list_recommendations(&id).await.unwrap().is_empty());
        assert!(store.list_by_category("site").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_restore_under_new_category_moves_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();
        let text = "Outfall 3 sampling results, turbidity 180 NTU";
        let id = store.store(text, 46, upload("outfall.txt", "inspection")).await.unwrap();
        let again = store.store(text, 46, upload("outfall.txt", "monitoring")).await.unwrap();
        assert_eq!(id, again);
        assert!(store.contains(&id).await.unwrap());

        assert!(store.list_by_category("inspection").await.unwrap().is_empty());
        let moved = store.list_by_category("monitoring").await.unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].category, "monitoring");
        assert_eq!(store.categories().await.unwrap(), vec!["monitoring"]);

        store.delete(&id).await.unwrap();
        assert!(!store.contains(&id).await.unwrap());
        assert!(store.list_by_category("monitoring").await.unwrap().is_empty());
        assert!(store.categories().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_categories_and_library() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();
        store.store("permit text", 11, upload("permit.txt", "permit")).await.unwrap();
        store.store("bmp handbook", 12, upload("bmp.txt", "reference")).await.unwrap();

        assert_eq!(store.categories().await.unwrap(), vec!["permit", "reference"]);
        assert_eq!(store.library().await.unwrap().len(), 2);
        assert_eq!(store.list_by_category("permit").await.unwrap().len(), 1);
    }
}
