use std::time::Duration;

use crate::analysis::{DocumentKind, GeneratedDocument};
use crate::dispatch::{Request, RequestKind};
use crate::state::Context;
use serde_json::json;
use tracing::info;

use super::send_chunked;

/// Draft a compliance document from the reference library
#[poise::command(slash_command, guild_only)]
pub async fn generate(
    ctx: Context<'_>,
    #[description = "swppp | inspection-report | corrective-action | sampling-plan"]
    #[autocomplete = "autocomplete_kind"]
    kind: String,
    #[description = "Extra drafting instructions"] instructions: Option<String>,
) -> Result<(), anyhow::Error> {
    let kind: DocumentKind = match kind.parse() {
        Ok(kind) => kind,
        Err(e) => {
            ctx.say(format!("{}. Choose one of the suggested kinds.", e)).await?;
            return Ok(());
        }
    };
    ctx.defer().await?;

    info!(user = ctx.author().name, kind = %kind, "Document generation requested");
    let timeout = Duration::from_secs(ctx.data().config.read().await.dispatch_timeout_secs);
    let reply = ctx
        .data()
        .dispatcher
        .dispatch_with_timeout(
            Request::new(
                RequestKind::DocumentGeneration,
                json!({ "kind": kind.to_string(), "instructions": instructions }),
            ),
            timeout,
        )
        .await?;
    let doc: GeneratedDocument = serde_json::from_value(reply)?;

    let mut full = format!("**{}**", doc.title);
    if doc.fallback {
        full.push_str(" _(template: model unavailable)_");
    }
    full.push_str("\n\n");
    full.push_str(&doc.content);
    send_chunked(&ctx, &full).await
}

async fn autocomplete_kind(_ctx: Context<'_>, partial: &str) -> Vec<String> {
    DocumentKind::ALL
        .iter()
        .map(|k| k.to_string())
        .filter(|k| k.contains(&partial.to_lowercase()))
        .collect()
}
