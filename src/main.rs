mod analysis;
mod calc;
mod commands;
mod dispatch;
mod docs;
mod llm;
mod state;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use poise::serenity_prelude as serenity;
use poise::{Framework, FrameworkOptions};
use tokio::sync::RwLock;
use tracing::{error, info, warn, Level};

use analysis::Analyzer;
use calc::CalcRunner;
use dispatch::{Backend, Dispatcher, Handler, RequestKind, ResourceUsage};
use docs::DocumentStore;
use llm::LlmClient;
use state::{AnalysisConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::DEBUG)
        .init();

    // Load env
    let _ = dotenv::dotenv();
    let token = dotenv::var("DISCORD_TOKEN").context("DISCORD_TOKEN required")?;
    let guild_id: Option<serenity::GuildId> = dotenv::var("DISCORD_GUILD_ID")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(serenity::GuildId::new);

    // Init storage
    let data_dir = std::path::PathBuf::from(
        dotenv::var("DATA_DIR").unwrap_or_else(|_| "./data/store".to_string()),
    );
    let store = Arc::new(DocumentStore::new(&data_dir).await?);
    info!("Document store initialized at {:?}", data_dir);

    // Init model client; absent credentials mean fallback mode
    let llm_client = LlmClient::from_env()?.map(Arc::new);
    match &llm_client {
        Some(client) => info!(model = client.model(), "LLM client initialized"),
        None => warn!("No LLM API key configured; analyses will run in fallback mode"),
    }

    // Parse admin user IDs from env
    let admin_ids: HashSet<u64> = dotenv::var("ADMIN_USER_IDS")
        .unwrap_or_default()
        .split(',')
        .filter_map(|s| s.trim().parse::<u64>().ok())
        .collect();
    if !admin_ids.is_empty() {
        info!(count = admin_ids.len(), "Admin users configured");
    }

    let analysis_config = AnalysisConfig::from_env();
    let calc = Arc::new(CalcRunner::from_env());
    if !calc.health_check().await {
        warn!(interpreter = calc.interpreter(), "Calculation interpreter not available");
    }

    let dispatcher = Arc::new(Dispatcher::new(Duration::from_secs(
        analysis_config.dispatch_timeout_secs,
    )));
    let config = Arc::new(RwLock::new(analysis_config));
    let analyzer = Arc::new(Analyzer::new(llm_client, store.clone()));

    register_handlers(&dispatcher, &analyzer, &calc, &config).await;

    let app_state = AppState {
        store,
        analyzer,
        dispatcher,
        admin_ids,
        config,
    };

    let intents =
        serenity::GatewayIntents::GUILDS | serenity::GatewayIntents::GUILD_MESSAGES;

    let framework = Framework::builder()
        .options(FrameworkOptions {
            commands: vec![commands::storm()],
            on_error: |err| Box::pin(on_error(err)),
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot connected as: {} ({})", ready.user.name, ready.user.id);

                let commands = &framework.options().commands;
                info!("Registering {} top-level command(s):", commands.len());
                for cmd in commands {
                    info!("  /{} ({} subcommands)", cmd.name, cmd.subcommands.len());
                    for sub in &cmd.subcommands {
                        info!("    /{} {}", cmd.name, sub.name);
                    }
                }

                if let Some(gid) = guild_id {
                    info!("Registering to guild {} (instant)", gid);
                    poise::builtins::register_in_guild(
                        ctx,
                        &framework.options().commands,
                        gid,
                    )
                    .await?;
                } else {
                    info!("Registering globally (up to 1 hour delay)");
                    poise::builtins::register_globally(
                        ctx,
                        &framework.options().commands,
                    )
                    .await?;
                }

                Ok(app_state)
            })
        })
        .build();

    info!("Starting stormwater analyst bot...");

    let mut client = serenity::ClientBuilder::new(&token, intents)
        .framework(framework)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create client: {}", e))?;

    if let Err(e) = client.start().await {
        error!("Client error: {}", e);
    }

    Ok(())
}

/// Handlers behind the request dispatcher: the analysis pipeline, the
/// calculation runner, and two fixed reference payloads.
async fn register_handlers(
    dispatcher: &Dispatcher,
    analyzer: &Arc<Analyzer>,
    calc: &Arc<CalcRunner>,
    config: &Arc<RwLock<AnalysisConfig>>,
) {
    let handlers = [
        Handler::new(
            "analysis",
            vec![RequestKind::DocumentAnalysis, RequestKind::DocumentGeneration],
            ResourceUsage { cpu_percent: 10.0, memory_mb: 256.0 },
            Backend::Analysis {
                analyzer: analyzer.clone(),
                config: config.clone(),
            },
        ),
        Handler::new(
            "calculator",
            vec![RequestKind::Calculation],
            ResourceUsage { cpu_percent: 40.0, memory_mb: 512.0 },
            Backend::Calculator {
                runner: calc.clone(),
                config: config.clone(),
            },
        ),
        Handler::new(
            "inspection-checklist",
            vec![RequestKind::InspectionChecklist],
            ResourceUsage { cpu_percent: 1.0, memory_mb: 16.0 },
            Backend::Static(dispatch::inspection_checklist()),
        ),
        Handler::new(
            "bmp-reference",
            vec![RequestKind::BmpReference],
            ResourceUsage { cpu_percent: 1.0, memory_mb: 16.0 },
            Backend::Static(dispatch::bmp_reference()),
        ),
    ];
    for handler in handlers {
        dispatcher.register(handler).await;
    }
}

/// Report command failures to the user instead of failing silently.
async fn on_error(err: poise::FrameworkError<'_, AppState, anyhow::Error>) {
    match err {
        poise::FrameworkError::Command { error, ctx, .. } => {
            error!(command = %ctx.command().name, "Command failed: {:#}", error);
            if let Err(e) = ctx.say(format!("Error: {}", error)).await {
                error!("Failed to report error: {}", e);
            }
        }
        other => {
            if let Err(e) = poise::builtins::on_error(other).await {
                error!("Error while handling error: {}", e);
            }
        }
    }
}
