use anyhow::{Context, Result};
use tracing::info;

use super::types::DocId;
use super::{DocumentStore, NewDocument};

/// Convert uploaded bytes to the text that is stored and fed to prompts.
///
/// HTML is flattened with html2text; images are kept as a short placeholder
/// because their content only reaches the model as an attached image block.
/// Everything else is read as UTF-8 (lossy). Binary office formats are not
/// extracted here.
pub fn extract_text(bytes: &[u8], filename: &str, content_type: Option<&str>) -> String {
    let content_type = content_type.unwrap_or("");
    let lower = filename.to_lowercase();

    if content_type.starts_with("image/") {
        return format!(
            "[Image upload: {} ({} bytes). Visual content is analyzed from the attached image.]",
            filename,
            bytes.len()
        );
    }

    if content_type.contains("html") || lower.ends_with(".html") || lower.ends_with(".htm") {
        return html2text::from_read(bytes, 120)
            .unwrap_or_else(|_| String::from_utf8_lossy(bytes).to_string());
    }

    String::from_utf8_lossy(bytes).to_string()
}

/// Ingest an uploaded file into the library.
/// Returns (doc_id, stored text length in chars).
pub async fn ingest_upload(
    store: &DocumentStore,
    bytes: &[u8],
    filename: &str,
    content_type: Option<&str>,
    category: &str,
    description: Option<&str>,
) -> Result<(DocId, usize)> {
    let text = extract_text(bytes, filename, content_type);
    let source = format!("upload:{}", filename);
    let doc_id = store
        .store(
            &text,
            bytes.len(),
            NewDocument {
                original_name: filename,
                source: &source,
                category,
                description,
                content_type,
            },
        )
        .await?;

    let chars = text.chars().count();
    info!(doc_id = %doc_id, filename, file_size = bytes.len(), chars, category, "Upload ingested");
    Ok((doc_id, chars))
}

/// Ingest a web page (regulation text, BMP fact sheet) by fetching its content.
pub async fn ingest_url(
    store: &DocumentStore,
    url: &str,
    category: &str,
) -> Result<(DocId, usize)> {
    let resp = reqwest::get(url)
        .await
        .context("Failed to fetch URL")?
        .error_for_status()
        .context("URL returned an error status")?;

    let content_type = resp
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let body = resp.bytes().await.context("Failed to read response body")?;

    let name = url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(url);
    let text = extract_text(&body, name, Some(&content_type));
    let source = format!("url:{}", url);
    let doc_id = store
        .store(
            &text,
            body.len(),
            NewDocument {
                original_name: name,
                source: &source,
                category,
                description: None,
                content_type: Some(&content_type),
            },
        )
        .await?;

    info!(doc_id = %doc_id, size = text.len(), category, "URL ingested");
    Ok((doc_id, text.chars().count()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_plain_text() {
        let text = extract_text(b"Inlet protection required", "notes.txt", Some("text/plain"));
        assert_eq!(text, "Inlet protection required");
    }

    #[test]
    fn test_extract_html_strips_tags() {
        let html = b"<html><body><h1>BMP</h1><p>Check dams</p></body></html>";
        let text = extract_text(html, "bmp.html", None);
        assert!(text.contains("Check dams"));
        assert!(!text.contains("<p>"));
    }

    #[test]
    fn test_extract_image_placeholder() {
        let text = extract_text(&[0u8; 64], "outfall.jpg", Some("image/jpeg"));
        assert!(text.starts_with("[Image upload: outfall.jpg (64 bytes)"));
    }

    #[tokio::test]
    async fn test_ingest_upload_stores_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();
        let body = "Weekly inspection: silt fence down at station 4+50.";
        let (id, chars) = ingest_upload(
            &store,
            body.as_bytes(),
            "inspection-0412.txt",
            Some("text/plain"),
            "inspection",
            Some("April walk"),
        )
        .await
        .unwrap();

        assert_eq!(chars, body.chars().count());
        let meta = store.get_meta(&id).await.unwrap();
        assert_eq!(meta.source, "upload:inspection-0412.txt");
        assert_eq!(meta.category, "inspection");
        assert_eq!(meta.description.as_deref(), Some("April walk"));
        assert_eq!(store.get_content(&id).await.unwrap(), body);
    }

    #[tokio::test]
    async fn test_ingest_url_flattens_html() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/fact-sheets/se-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/html")
                    .set_body_string("<html><body><h1>SE-1 Silt Fence</h1><p>Trench the fabric 6 inches.</p></body></html>"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let store = DocumentStore::new(dir.path()).await.unwrap();
        let url = format!("{}/fact-sheets/se-1", server.uri());
        let (id, _) = ingest_url(&store, &url, "reference").await.unwrap();

        let doc = store.get_document(&id).await.unwrap();
        assert_eq!(doc.original_name, "se-1");
        assert!(doc.content.contains("Trench the fabric"));
        assert!(!doc.content.contains("<p>"));
    }
}
