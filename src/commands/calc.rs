use std::time::Duration;

use crate::calc::formulas::Formula;
use crate::calc::CalculationResult;
use crate::dispatch::{Request, RequestKind};
use crate::state::Context;
use serde_json::json;
use tracing::info;

use super::send_chunked;

/// Run a hydrology calculation, optionally recording it against a document
#[poise::command(slash_command, guild_only)]
pub async fn calc(
    ctx: Context<'_>,
    #[description = "rational | scs | detention"]
    #[autocomplete = "autocomplete_formula"]
    formula: String,
    #[description = "Parameters, e.g. `c=0.9 i=2.5 a=1.2`"] params: String,
    #[description = "Attach the result to this document"]
    #[autocomplete = "super::autocomplete_document"]
    document: Option<String>,
) -> Result<(), anyhow::Error> {
    // Validate before spending a subprocess on it.
    if let Err(e) = Formula::from_params(&formula, &params) {
        ctx.say(format!("Invalid calculation: {}", e)).await?;
        return Ok(());
    }
    ctx.defer().await?;

    let timeout = Duration::from_secs(ctx.data().config.read().await.dispatch_timeout_secs);
    info!(user = ctx.author().name, formula, params, "Calculation requested");

    let reply = ctx
        .data()
        .dispatcher
        .dispatch_with_timeout(
            Request::new(
                RequestKind::Calculation,
                json!({ "formula": formula, "params": params }),
            ),
            timeout,
        )
        .await?;

    let label = reply["formula"].as_str().unwrap_or("calculation").to_string();
    let result: CalculationResult = serde_json::from_value(reply["result"].clone())?;

    if !result.success {
        ctx.say(format!(
            "**{}** failed: {}",
            label,
            result.error.as_deref().unwrap_or("unknown error")
        ))
        .await?;
        return Ok(());
    }

    let mut output = format!("**{}**\n", label);
    match result.report() {
        Some(report) => {
            output.push_str(&format!("{}\n", report.analysis.summary));
            for insight in &report.analysis.insights {
                output.push_str(&format!("- {}\n", insight));
            }
            for rec in &report.analysis.recommendations {
                output.push_str(&format!("> {}\n", rec));
            }
            if !report.plots.is_empty() {
                output.push_str(&format!("{} plot(s) generated\n", report.plots.len()));
            }

            if let Some(doc_id) = document.as_deref() {
                let mut insights = report.analysis.insights.clone();
                insights.extend(report.analysis.recommendations.iter().cloned());
                let id = ctx
                    .data()
                    .analyzer
                    .attach_calculation(doc_id, &label, report.analysis.summary.clone(), insights)
                    .await?;
                output.push_str(&format!("\nRecorded against document as `{}`", id));
            }
        }
        None => {
            output.push_str(result.output.as_deref().unwrap_or("(no output)").trim());
        }
    }

    send_chunked(&ctx, &output).await
}

/// Show the inspection checklist or BMP reference
#[poise::command(slash_command, guild_only)]
pub async fn reference(
    ctx: Context<'_>,
    #[description = "checklist | bmps"] topic: String,
) -> Result<(), anyhow::Error> {
    let kind = match topic.trim().to_lowercase().as_str() {
        "checklist" | "inspection" => RequestKind::InspectionChecklist,
        "bmps" | "bmp" => RequestKind::BmpReference,
        other => {
            ctx.say(format!("Unknown topic `{}`. Valid: `checklist`, `bmps`", other))
                .await?;
            return Ok(());
        }
    };

    let reply = ctx
        .data()
        .dispatcher
        .dispatch(Request::new(kind, serde_json::Value::Null))
        .await?;

    let mut output = format!("**{}**\n", reply["title"].as_str().unwrap_or("Reference"));
    if let Some(sections) = reply["sections"].as_array() {
        for section in sections {
            output.push_str(&format!("\n__{}__\n", section["name"].as_str().unwrap_or("")));
            for item in section["items"].as_array().into_iter().flatten() {
                output.push_str(&format!("- [ ] {}\n", item.as_str().unwrap_or("")));
            }
        }
    }
    if let Some(bmps) = reply["bmps"].as_array() {
        for bmp in bmps {
            output.push_str(&format!(
                "- `{}` {} ({})\n",
                bmp["code"].as_str().unwrap_or(""),
                bmp["name"].as_str().unwrap_or(""),
                bmp["type"].as_str().unwrap_or("")
            ));
        }
    }

    send_chunked(&ctx, &output).await
}

async fn autocomplete_formula(_ctx: Context<'_>, partial: &str) -> Vec<String> {
    Formula::NAMES
        .iter()
        .filter(|n| n.contains(&partial.to_lowercase()))
        .map(|n| n.to_string())
        .collect()
}
