use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use pipeflow_rs::pipeflow::config::EngineConfig;
use pipeflow_rs::pipeflow::pipeline::{
    Graph, Pipeline, PipelineLoader, PipelineStatus, RunStatus,
};
use pipeflow_rs::pipeflow::registry::PipelineRegistry;
use pipeflow_rs::pipeflow::store::RunFilter;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check a pipeline definition without running it
    Validate {
        /// Path to the pipeline file (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,
    },
    /// Run a pipeline once and print the final run record
    Run {
        /// Path to the pipeline file (YAML or JSON)
        #[arg(short, long)]
        file: PathBuf,

        /// Trigger payload as JSON
        #[arg(short, long, default_value = "{}")]
        payload: String,

        /// Engine config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// List past runs of a stored pipeline
    History {
        /// Pipeline id
        #[arg(long)]
        pipeline: String,

        /// Only runs with this status
        #[arg(short, long)]
        status: Option<String>,

        #[arg(short, long, default_value_t = 20)]
        limit: usize,

        /// Engine config file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::init();

    let args = Args::parse();

    match args.command {
        Commands::Validate { file } => {
            let def = PipelineLoader::new()
                .load_file(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            let pipeline = Pipeline::from_definition(def);
            Graph::from_pipeline(&pipeline).validate()?;
            println!(
                "{}: valid ({} nodes, {} edges)",
                pipeline.name,
                pipeline.nodes.len(),
                pipeline.edges.len()
            );
        }
        Commands::Run {
            file,
            payload,
            config,
        } => {
            let def = PipelineLoader::new()
                .load_file(&file)
                .with_context(|| format!("loading {}", file.display()))?;
            let payload: serde_json::Value =
                serde_json::from_str(&payload).context("parsing --payload")?;
            let config = EngineConfig::load(config.as_deref())?;
            let registry = PipelineRegistry::from_config(config).await?;

            let existing = match &def.id {
                Some(id) => registry.get(id).await.ok(),
                None => None,
            };
            let mut pipeline = match existing {
                Some(existing) => registry.update(&existing.id, def).await?,
                None => registry.create(def).await?,
            };
            if pipeline.status != PipelineStatus::Active {
                pipeline = registry.toggle(&pipeline.id).await?;
            }

            let ticket = registry.request_run(&pipeline.id, payload).await?;
            let run_id = ticket.run_id.clone();
            log::info!("Running pipeline '{}' as run {}", pipeline.name, run_id);

            let wait = ticket.wait();
            tokio::pin!(wait);
            let run = tokio::select! {
                run = &mut wait => run?,
                _ = tokio::signal::ctrl_c() => {
                    log::warn!("Interrupted, cancelling run {}", run_id);
                    registry.cancel_run(&run_id).await?;
                    wait.await?
                }
            };

            let details = registry.get_run(&run.id).await?;
            println!("{}", serde_json::to_string_pretty(&details.run)?);
            for entry in &details.logs {
                println!(
                    "{} {:5} {:10} {}",
                    entry.timestamp.to_rfc3339(),
                    entry.level.as_str(),
                    entry.node_id.as_deref().unwrap_or("-"),
                    entry.message
                );
            }

            if run.status != RunStatus::Completed {
                bail!(
                    "run {} finished {}: {}",
                    run.id,
                    run.status,
                    run.error.unwrap_or_default()
                );
            }
        }
        Commands::History {
            pipeline,
            status,
            limit,
            config,
        } => {
            let config = EngineConfig::load(config.as_deref())?;
            if config.database_url.is_none() {
                bail!("history needs a database; set database_url or PIPEFLOW_DATABASE_URL");
            }
            let status = match status {
                Some(s) => match RunStatus::parse(&s) {
                    Some(status) => Some(status),
                    None => bail!("unknown run status '{}'", s),
                },
                None => None,
            };

            let registry = PipelineRegistry::from_config(config).await?;
            let filter = RunFilter {
                status,
                limit: Some(limit),
            };
            for run in registry.get_runs(&pipeline, &filter).await? {
                println!(
                    "{}  {:9}  {}  {}",
                    run.id,
                    run.status.as_str(),
                    run.created_at.to_rfc3339(),
                    run.duration_seconds()
                        .map(|d| format!("{:.1}s", d))
                        .unwrap_or_else(|| "-".to_string())
                );
            }
        }
    }

    Ok(())
}
