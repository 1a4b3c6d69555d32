use std::time::Duration;

use crate::analysis::AnalysisReport;
use crate::dispatch::{Request, RequestKind, ReviewItem};
use crate::docs::types::AnalysisMode;
use crate::state::Context;
use serde_json::{json, Value as JsonValue};
use tracing::{info, warn};

use super::send_chunked;

/// Send a document analysis request through the dispatcher.
pub(crate) async fn dispatch_analysis(ctx: &Context<'_>, data: JsonValue) -> Result<JsonValue, anyhow::Error> {
    let timeout = Duration::from_secs(ctx.data().config.read().await.dispatch_timeout_secs);
    let reply = ctx
        .data()
        .dispatcher
        .dispatch_with_timeout(Request::new(RequestKind::DocumentAnalysis, data), timeout)
        .await?;
    Ok(reply)
}

/// Analyze a stored document against the reference library
#[poise::command(slash_command, guild_only)]
pub async fn analyze(
    ctx: Context<'_>,
    #[description = "Document"]
    #[autocomplete = "super::autocomplete_document"]
    document: String,
    #[description = "Specific question about the document"] query: Option<String>,
) -> Result<(), anyhow::Error> {
    let user_mention = format!("<@{}>", ctx.author().id);
    ctx.say(format!(
        "Reviewing the document against the library. I'll ping you when it's done, {}",
        user_mention
    ))
    .await?;

    info!(user = ctx.author().name, document, "Analysis requested");

    let reply = dispatch_analysis(&ctx, json!({ "document_id": document, "query": query })).await?;
    let report: AnalysisReport = serde_json::from_value(reply)?;

    let full = format!("{}\n\n{}", user_mention, format_report(&report));
    send_chunked(&ctx, &full).await
}

/// Analyze every document in a category
#[poise::command(slash_command, guild_only)]
pub async fn review(
    ctx: Context<'_>,
    #[description = "Library category"]
    #[autocomplete = "super::autocomplete_category"]
    category: String,
    #[description = "Question applied to each document"] query: Option<String>,
) -> Result<(), anyhow::Error> {
    ctx.defer().await?;

    let reply = dispatch_analysis(&ctx, json!({ "category": category, "query": query })).await?;
    let results: Vec<ReviewItem> = serde_json::from_value(reply)?;

    if results.is_empty() {
        ctx.say(format!("No documents in category **{}**.", category)).await?;
        return Ok(());
    }

    let mut output = format!("**Category review: {}** ({} documents)\n", category, results.len());
    for item in &results {
        match (&item.report, &item.error) {
            (Some(report), _) => {
                output.push_str(&format!("\n{}\n", format_report(report)));
            }
            (None, error) => {
                let error = error.as_deref().unwrap_or("no report");
                warn!(document = %item.document, error, "Category review item failed");
                output.push_str(&format!("\n**{}**: analysis failed ({})\n", item.document, error));
            }
        }
    }

    send_chunked(&ctx, &output).await
}

/// Show stored recommendations for a document
#[poise::command(slash_command, guild_only)]
pub async fn recommendations(
    ctx: Context<'_>,
    #[description = "Document"]
    #[autocomplete = "super::autocomplete_document"]
    document: String,
) -> Result<(), anyhow::Error> {
    let store = &ctx.data().store;
    let meta = store.get_meta(&document).await?;
    let recs = store.list_recommendations(&document).await?;
    let analyses = store.list_analyses(&document, 5).await?;

    let mut output = format!("**{}**\n", meta.original_name);
    if recs.is_empty() {
        output.push_str("No recommendations stored yet. Use `/storm analyze` first.\n");
    }
    for rec in &recs {
        output.push_str(&format!(
            "- [{}] **{}**: {}\n  _{}_\n",
            rec.subcategory.as_deref().unwrap_or(&rec.category),
            rec.title,
            rec.content,
            rec.citation
        ));
    }

    let calcs: Vec<_> = analyses
        .iter()
        .filter(|a| a.mode == AnalysisMode::Calculation)
        .collect();
    if !calcs.is_empty() {
        output.push_str("\n**Calculations:**\n");
        for calc in calcs {
            output.push_str(&format!(
                "- {}: {}\n",
                calc.query.as_deref().unwrap_or("calculation"),
                calc.analysis
            ));
        }
    }

    send_chunked(&ctx, &output).await
}

/// Discord rendering of a stored analysis.
pub(crate) fn format_report(report: &AnalysisReport) -> String {
    let result = &report.outcome.result;
    let mut out = format!("**Analysis of {}**", report.document_name);
    if let AnalysisMode::Fallback(reason) = &report.outcome.mode {
        out.push_str(&format!(" _(fallback mode: {})_", reason));
    }
    out.push_str(&format!("\n{}\n\n**Insights:**\n", result.analysis));
    for insight in &result.insights {
        out.push_str(&format!("- {}\n", insight));
    }
    out.push_str("\n**Recommendations:**\n");
    for (i, rec) in result.recommendations.iter().enumerate() {
        out.push_str(&format!(
            "{}. **{}**: {} _({})_\n",
            i + 1,
            rec.title,
            rec.content,
            rec.citation
        ));
    }
    out.push_str(&format!("Analysis ID: `{}`", report.analysis_id));
    out
}
