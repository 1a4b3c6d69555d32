use std::collections::BTreeMap;

use crate::state::Context;
use tracing::info;

use super::send_chunked;

/// List the document library, grouped by category
#[poise::command(slash_command, guild_only)]
pub async fn library(
    ctx: Context<'_>,
    #[description = "Only this category"]
    #[autocomplete = "super::autocomplete_category"]
    category: Option<String>,
    #[description = "Max documents to show"] limit: Option<u32>,
) -> Result<(), anyhow::Error> {
    let limit = limit.unwrap_or(20) as usize;
    let store = &ctx.data().store;
    let docs = match category.as_deref() {
        Some(cat) => {
            let mut docs = store.list_by_category(cat).await?;
            docs.truncate(limit);
            docs
        }
        None => store.list(limit).await?,
    };

    if docs.is_empty() {
        ctx.say("The library is empty. Use `/storm upload` or `/storm ingest` to add documents.")
            .await?;
        return Ok(());
    }

    let mut by_category: BTreeMap<&str, Vec<_>> = BTreeMap::new();
    for doc in &docs {
        by_category.entry(doc.category.as_str()).or_default().push(doc);
    }

    let mut output = String::from("**Document Library**\n\n");
    for (category, docs) in &by_category {
        output.push_str(&format!("**{}**\n", category));
        for doc in docs {
            let uploaded = chrono::DateTime::from_timestamp(doc.uploaded_at, 0)
                .map(|t| t.format("%Y-%m-%d").to_string())
                .unwrap_or_default();
            output.push_str(&format!(
                "  - {} ({} KB, {}) `{}`\n",
                doc.original_name,
                doc.file_size / 1024,
                uploaded,
                &doc.id[..12.min(doc.id.len())]
            ));
            if let Some(desc) = &doc.description {
                output.push_str(&format!("    {}\n", desc));
            }
        }
        output.push('\n');
    }

    send_chunked(&ctx, &output).await
}

/// Delete a document and its analyses (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn delete(
    ctx: Context<'_>,
    #[description = "Document"]
    #[autocomplete = "super::autocomplete_document"]
    document: String,
) -> Result<(), anyhow::Error> {
    if !ctx.data().is_admin(ctx.author().id.get()) {
        ctx.say("This command is admin-only.").await?;
        return Ok(());
    }

    let store = &ctx.data().store;
    let meta = store.get_meta(&document).await?;
    let removed = store.delete(&document).await?;
    info!(user = ctx.author().name, doc_id = %document, removed, "Document deleted");

    ctx.say(format!(
        "Deleted **{}** and {} dependent record(s).",
        meta.original_name, removed
    ))
    .await?;
    Ok(())
}
