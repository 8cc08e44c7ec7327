//! contractq CLI: run the workers, submit documents, inspect and review contracts.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use contractq::collab::{HttpNotifier, HttpRenderer};
use contractq::config::Config;
use contractq::config::secrets::{ExposeSecret, share};
use contractq::db::Db;
use contractq::engine::{Collaborators, Pipeline, ReviewResolution, serve};
use contractq::event::TracingSink;
use contractq::model::{ContractId, DocumentRef, Submission};
use contractq::ocr::http::HttpOcrClient;
use contractq::telemetry::{TelemetryConfig, init_telemetry};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "contractq", about = "Contract document pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run worker pools for every queue
    Serve,
    /// Submit a document for processing, or a JSON batch of them
    Submit(SubmitArgs),
    /// Show a contract's status
    Status {
        id: ContractId,
        /// Include the transition history
        #[arg(long)]
        history: bool,
    },
    /// Resolve a contract waiting in NEEDS_REVIEW
    Review {
        id: ContractId,
        #[command(subcommand)]
        decision: Decision,
    },
    /// Show queue depths
    Queues,
}

#[derive(Args)]
struct SubmitArgs {
    /// JSON array of submissions, each admitted on its own
    #[arg(long, conflicts_with_all = ["uri", "file", "size", "org", "caller"])]
    batch: Option<PathBuf>,
    /// Storage URI of the uploaded document
    #[arg(long, required_unless_present = "batch")]
    uri: Option<String>,
    /// Original file name (its extension is checked)
    #[arg(long, required_unless_present = "batch")]
    file: Option<String>,
    #[arg(long, required_unless_present = "batch")]
    size: Option<u64>,
    #[arg(long, default_value = "application/pdf")]
    content_type: String,
    /// Organization the contract belongs to
    #[arg(long, required_unless_present = "batch")]
    org: Option<String>,
    /// Caller charged for the submission
    #[arg(long, required_unless_present = "batch")]
    caller: Option<String>,
}

#[derive(Subcommand)]
enum Decision {
    /// Accept the contract, optionally with corrected data (JSON)
    Approve {
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        data: Option<String>,
    },
    /// Fail the contract
    Reject {
        #[arg(long)]
        reviewer: String,
        #[arg(long)]
        reason: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "contractq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    let pipeline = Arc::new(build_pipeline(&config).await?);

    match cli.command {
        Command::Serve => cmd_serve(pipeline).await,
        Command::Submit(args) => cmd_submit(&pipeline, args).await,
        Command::Status { id, history } => cmd_status(&pipeline, id, history).await,
        Command::Review { id, decision } => {
            let resolution = match decision {
                Decision::Approve { reviewer, data } => ReviewResolution::Approve {
                    corrected_data: data.map(|d| serde_json::from_str(&d)).transpose()?,
                    reviewer,
                },
                Decision::Reject { reviewer, reason } => {
                    ReviewResolution::Reject { reason, reviewer }
                }
            };
            let status = pipeline.resolve_review(id, resolution).await?;
            println!("{id}: {} (version {})", status.state, status.version);
            Ok(())
        }
        Command::Queues => {
            println!("{:<16}  DEPTH", "QUEUE");
            for (queue, depth) in pipeline.router().depths().await? {
                println!("{:<16}  {depth}", queue.as_str());
            }
            Ok(())
        }
    }
}

async fn build_pipeline(config: &Config) -> anyhow::Result<Pipeline> {
    let tuning = config.pipeline()?;

    let db = Db::connect(config.database_url.expose_secret()).await?;
    db.migrate().await?;

    let collaborators = Collaborators {
        store: Arc::new(db.contracts()),
        queue: Arc::new(db.queues()),
        ocr: Arc::new(HttpOcrClient::new(
            config.ocr_endpoint.clone(),
            share(&config.ocr_api_key),
        )),
        renderer: Arc::new(HttpRenderer::new(
            config.po_renderer_url.clone(),
            config.collaborator_api_key.as_ref().map(share),
            tuning.stages.po_generation.hard_limit(),
        )),
        notifier: Arc::new(HttpNotifier::new(
            config.notifier_url.clone(),
            config.collaborator_api_key.as_ref().map(share),
            tuning.stages.notification.hard_limit(),
        )),
        events: Arc::new(TracingSink),
    };
    Ok(Pipeline::new(collaborators, tuning))
}

async fn cmd_submit(pipeline: &Pipeline, args: SubmitArgs) -> anyhow::Result<()> {
    pipeline.init().await?;

    if let Some(path) = args.batch {
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read batch file {}", path.display()))?;
        let submissions: Vec<Submission> = serde_json::from_str(&raw)
            .with_context(|| format!("invalid batch file {}", path.display()))?;
        let results = pipeline.submit_batch(submissions).await;
        for (index, result) in results.iter().enumerate() {
            match result {
                Ok(id) => println!("{index:>4}  submitted  {id}"),
                Err(e) => println!("{index:>4}  rejected   {e}"),
            }
        }
        let rejected = results.iter().filter(|r| r.is_err()).count();
        println!("{} submitted, {rejected} rejected", results.len() - rejected);
        return Ok(());
    }

    let (Some(uri), Some(file_name), Some(size_bytes), Some(organization_id), Some(submitted_by)) =
        (args.uri, args.file, args.size, args.org, args.caller)
    else {
        anyhow::bail!("--uri, --file, --size, --org and --caller are required without --batch");
    };
    let id = pipeline
        .submit(Submission {
            document: DocumentRef {
                uri,
                file_name,
                content_type: args.content_type,
                size_bytes,
            },
            organization_id,
            submitted_by,
        })
        .await?;
    println!("Submitted: {id}");
    Ok(())
}

async fn cmd_serve(pipeline: Arc<Pipeline>) -> anyhow::Result<()> {
    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown requested, draining workers");
        stop.send(true).ok();
    });

    serve(pipeline, shutdown).await?;
    Ok(())
}

async fn cmd_status(pipeline: &Pipeline, id: ContractId, history: bool) -> anyhow::Result<()> {
    let status = pipeline.get_status(id).await?;
    println!("{}", serde_json::to_string_pretty(&status)?);

    if history {
        let contract = pipeline.get_contract(id).await?;
        println!("---");
        for t in &contract.history {
            println!(
                "v{:<4} {}  {} -> {}  {}",
                t.version,
                t.timestamp.format("%Y-%m-%d %H:%M:%S"),
                t.from_state,
                t.to_state,
                t.reason.as_deref().unwrap_or("-")
            );
        }
    }
    Ok(())
}
