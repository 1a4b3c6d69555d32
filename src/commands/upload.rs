use crate::analysis::AnalysisReport;
use crate::docs::ingest as doc_ingest;
use crate::state::Context;
use base64::Engine;
use poise::serenity_prelude as serenity;
use serde_json::json;
use tracing::info;

use super::send_chunked;

const DEFAULT_CATEGORY: &str = "reference";

/// Upload a file to the document library, optionally analyzing it right away
#[poise::command(slash_command, guild_only)]
pub async fn upload(
    ctx: Context<'_>,
    #[description = "Document or site photo"] file: serenity::Attachment,
    #[description = "Library category (swppp, permit, inspection, reference...)"]
    #[autocomplete = "super::autocomplete_category"]
    category: Option<String>,
    #[description = "Short description"] description: Option<String>,
    #[description = "Analyze after upload"] analyze: Option<bool>,
) -> Result<(), anyhow::Error> {
    ctx.defer().await?;

    let category = category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    info!(
        user = ctx.author().name,
        filename = %file.filename,
        size = file.size,
        category,
        "Upload started"
    );

    let bytes = file.download().await?;
    let content_type = file.content_type.as_deref();
    let store = &ctx.data().store;
    let (doc_id, chars) = doc_ingest::ingest_upload(
        store,
        &bytes,
        &file.filename,
        content_type,
        &category,
        description.as_deref(),
    )
    .await?;

    let mut reply = format!(
        "Stored **{}** under **{}**\nDoc ID: `{}`\nSize: {} bytes, {} characters of text",
        file.filename, category, doc_id, bytes.len(), chars
    );

    if analyze.unwrap_or(false) {
        let mut request = json!({ "document_id": doc_id });
        if let Some(media_type) = content_type.filter(|ct| ct.starts_with("image/")) {
            request["image"] = json!({
                "media_type": media_type,
                "data": base64::engine::general_purpose::STANDARD.encode(&bytes),
            });
        }
        let analysis = super::analyze::dispatch_analysis(&ctx, request).await?;
        let report: AnalysisReport = serde_json::from_value(analysis)?;
        reply.push_str("\n\n");
        reply.push_str(&super::analyze::format_report(&report));
    }

    send_chunked(&ctx, &reply).await
}

/// Ingest a web page (regulation text, BMP fact sheet) into the library
#[poise::command(slash_command, guild_only)]
pub async fn ingest(
    ctx: Context<'_>,
    #[description = "URL of the page"] url: String,
    #[description = "Library category"]
    #[autocomplete = "super::autocomplete_category"]
    category: Option<String>,
) -> Result<(), anyhow::Error> {
    ctx.defer().await?;

    let category = category.unwrap_or_else(|| DEFAULT_CATEGORY.to_string());
    info!(user = ctx.author().name, url, category, "URL ingestion started");

    let store = &ctx.data().store;
    let (doc_id, chars) = doc_ingest::ingest_url(store, &url, &category).await?;
    let meta = store.get_meta(&doc_id).await?;

    ctx.say(format!(
        "Ingested **{}** under **{}**\nDoc ID: `{}`\nSize: {} bytes, {} characters of text",
        meta.original_name, category, doc_id, meta.file_size, chars
    ))
    .await?;

    Ok(())
}
