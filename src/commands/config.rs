use crate::dispatch::Health;
use crate::state::{AnalysisConfig, Context};
use tracing::info;

/// Configure analysis parameters (admin only)
#[poise::command(slash_command, guild_only)]
pub async fn config(
    ctx: Context<'_>,
    #[description = "Parameter name (omit to show all)"]
    #[autocomplete = "autocomplete_param"]
    param: Option<String>,
    #[description = "New value"] value: Option<String>,
) -> Result<(), anyhow::Error> {
    let user_id = ctx.author().id.get();
    if !ctx.data().is_admin(user_id) {
        ctx.say("This command is admin-only.").await?;
        return Ok(());
    }

    match (param.as_deref(), value.as_deref()) {
        (None, _) => {
            let config = ctx.data().config.read().await;
            ctx.say(format!("**Analysis Configuration:**\n{}", config.describe()))
                .await?;
        }
        (Some(key), Some(val)) => {
            let result = ctx.data().config.write().await.set(key, val);
            match result {
                Ok(()) => {
                    info!(user = ctx.author().name, param = key, value = val, "Config updated");
                    ctx.say(format!("`{}` set to {}", key, val)).await?;
                }
                Err(e) => {
                    ctx.say(e).await?;
                }
            }
        }
        (Some(_), None) => {
            ctx.say("Provide both `param` and `value`. Example: `/storm config reference_excerpt_chars 800`")
                .await?;
        }
    }

    Ok(())
}

/// Show request handlers and their health, re-initialising failed ones
#[poise::command(slash_command, guild_only)]
pub async fn handlers(ctx: Context<'_>) -> Result<(), anyhow::Error> {
    let dispatcher = &ctx.data().dispatcher;
    let recovered = dispatcher.health_sweep().await;

    let mut output = String::from("**Request Handlers**\n");
    for (name, kinds, health) in dispatcher.handlers().await {
        let status = match health {
            Health::Healthy => "healthy".to_string(),
            Health::Degraded => "degraded".to_string(),
            Health::Error(reason) => format!("error: {}", reason),
        };
        output.push_str(&format!("- **{}** [{}] {:?}\n", name, status, kinds));
    }
    if recovered > 0 {
        output.push_str(&format!("\nRecovered {} handler(s).", recovered));
    }

    ctx.say(output).await?;
    Ok(())
}

async fn autocomplete_param(_ctx: Context<'_>, partial: &str) -> Vec<String> {
    AnalysisConfig::PARAMS
        .iter()
        .filter(|p| p.contains(partial))
        .map(|p| p.to_string())
        .collect()
}
