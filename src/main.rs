use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use pipeline_analytics::models::{
    CreateOpportunityPayload, DateWindow, MigrateOpportunityPayload, RecordStageMovePayload, StageAlertConfig,
};
use pipeline_analytics::{init_tracing, PipelineConfig, PipelineCore};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "pipeline-analytics")]
#[command(version, about = "Stage alerts, velocity and pass-through analytics for sales funnels")]
struct Cli {
    /// YAML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured database path
    #[arg(long, global = true, env = "PIPELINE_DB_PATH")]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone, Copy)]
struct WindowArgs {
    /// Inclusive lower bound on transition time (RFC 3339)
    #[arg(long)]
    from: Option<DateTime<Utc>>,
    /// Inclusive upper bound on transition time (RFC 3339)
    #[arg(long)]
    to: Option<DateTime<Utc>>,
}

impl From<WindowArgs> for DateWindow {
    fn from(args: WindowArgs) -> Self {
        DateWindow::between(args.from, args.to)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Create a funnel
    CreateFunnel { name: String },
    /// List funnels
    Funnels,
    /// Append a stage to a funnel
    AddStage {
        #[arg(long)]
        funnel: String,
        #[arg(long)]
        name: String,
        /// Alert once an opportunity has been in the stage this many days
        #[arg(long)]
        alert_days: Option<u32>,
    },
    /// List a funnel's stages in order
    Stages {
        #[arg(long)]
        funnel: String,
    },
    /// Create an opportunity in a stage
    CreateOpportunity {
        #[arg(long)]
        funnel: String,
        #[arg(long)]
        stage: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Move an opportunity to another stage
    Move {
        #[arg(long)]
        opportunity: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Copy an opportunity into another funnel
    Migrate {
        #[arg(long)]
        opportunity: String,
        #[arg(long)]
        funnel: String,
        #[arg(long)]
        stage: String,
        #[arg(long)]
        user: Option<String>,
    },
    /// Show an opportunity's stage history
    History {
        #[arg(long)]
        opportunity: String,
    },
    /// Pass-through rate of one stage
    PassThrough {
        #[arg(long)]
        stage: String,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Per-stage pass-through, conversion and velocity for a funnel
    Report {
        #[arg(long)]
        funnel: String,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Average days in a stage, or across a funnel
    Velocity {
        #[arg(long, conflicts_with = "funnel", required_unless_present = "funnel")]
        stage: Option<String>,
        #[arg(long)]
        funnel: Option<String>,
        #[command(flatten)]
        window: WindowArgs,
    },
    /// Opportunities overdue in their stage
    Alerts {
        #[arg(long)]
        funnel: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PipelineConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    if let Some(db) = cli.db {
        config.database_path = db;
    }
    init_tracing(&config).context("Failed to initialize logging")?;

    let pipeline = PipelineCore::open(&config).context("Failed to open pipeline store")?;

    match cli.command {
        Commands::CreateFunnel { name } => print_json(&pipeline.create_funnel(&name).await?),
        Commands::Funnels => print_json(&pipeline.list_funnels().await?),
        Commands::AddStage {
            funnel,
            name,
            alert_days,
        } => {
            let alert_config = alert_days.map(|max_days_in_stage| StageAlertConfig {
                enabled: true,
                max_days_in_stage,
            });
            print_json(&pipeline.add_stage(&funnel, &name, alert_config).await?)
        }
        Commands::Stages { funnel } => print_json(&pipeline.list_stages(&funnel).await?),
        Commands::CreateOpportunity {
            funnel,
            stage,
            title,
            user,
        } => print_json(
            &pipeline
                .create_opportunity(CreateOpportunityPayload {
                    funnel_id: funnel,
                    stage_id: stage,
                    title,
                    user_id: user,
                })
                .await?,
        ),
        Commands::Move {
            opportunity,
            from,
            to,
            user,
        } => print_json(
            &pipeline
                .record_stage_move(RecordStageMovePayload {
                    opportunity_id: opportunity,
                    from_stage_id: from,
                    to_stage_id: to,
                    user_id: user,
                })
                .await?,
        ),
        Commands::Migrate {
            opportunity,
            funnel,
            stage,
            user,
        } => print_json(
            &pipeline
                .migrate_opportunity(MigrateOpportunityPayload {
                    opportunity_id: opportunity,
                    target_funnel_id: funnel,
                    target_stage_id: stage,
                    user_id: user,
                })
                .await?,
        ),
        Commands::History { opportunity } => print_json(&pipeline.get_opportunity_history(&opportunity).await?),
        Commands::PassThrough { stage, window } => {
            print_json(&pipeline.get_stage_pass_through_rate(&stage, window.into()).await?)
        }
        Commands::Report { funnel, window } => {
            print_json(&pipeline.get_funnel_pass_through_rates(&funnel, window.into()).await?)
        }
        Commands::Velocity { stage, funnel, window } => match (stage, funnel) {
            (Some(stage), _) => print_json(&pipeline.get_stage_velocity(&stage, window.into()).await?),
            (None, Some(funnel)) => {
                let average = pipeline.get_funnel_average_velocity(&funnel, window.into()).await?;
                print_json(&serde_json::json!({ "funnelId": funnel, "averageVelocity": average }))
            }
            (None, None) => anyhow::bail!("either --stage or --funnel is required"),
        },
        Commands::Alerts { funnel } => print_json(&pipeline.list_stage_alerts(&funnel).await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", rendered);
    Ok(())
}
