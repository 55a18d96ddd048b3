use clap::{Parser, Subcommand, ValueEnum};
use redress_cache::Kv as _;
use redress_service::{build_router, spawn_schedulers, CleanUsersExportJob, ServiceState, StorageMode};
use redress_store::{
    AttemptStore as _, BillingTarget, BlacklistStore as _, UploadStore as _,
};
use redress_types::{BillingModel, RedressConfig};
use redress_validate::run_validation;
use redress_vop::run_vop;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelArg {
    Legacy,
    Flywheel,
    Recovery,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum PhaseArg {
    Validation,
    Vop,
    Billing,
    Reconciliation,
}

impl From<ModelArg> for BillingModel {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Legacy => BillingModel::Legacy,
            ModelArg::Flywheel => BillingModel::Flywheel,
            ModelArg::Recovery => BillingModel::Recovery,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "redressd", version, about = "SEPA direct-debit recovery pipeline")]
struct Cli {
    /// Optional TOML configuration file (env: REDRESS_CONFIG).
    #[arg(long, env = "REDRESS_CONFIG")]
    config: Option<String>,
    /// PostgreSQL url; in-memory storage when absent.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the webhook ingress, workers and schedulers.
    Serve {
        /// Socket address to bind, e.g. 127.0.0.1:8080
        #[arg(long, default_value = "127.0.0.1:8080")]
        listen: SocketAddr,
    },
    /// Ingest a spreadsheet and run the pipeline phases over it.
    Ingest {
        /// Path to the stored spreadsheet (csv/tsv/xlsx/xls).
        file: PathBuf,
        /// Billing model for the upload.
        #[arg(long, value_enum, default_value_t = ModelArg::Legacy)]
        model: ModelArg,
        /// Operator id recorded on the upload.
        #[arg(long, default_value_t = 0)]
        uploader: i64,
        /// Also run validation, VOP and billing after ingesting.
        #[arg(long, default_value_t = false)]
        run_phases: bool,
    },
    /// Export recovered debtors to a CSV file.
    Export {
        /// Output path.
        out: PathBuf,
    },
    /// Re-run one pipeline phase for an upload (idempotent per phase).
    RunPhase {
        upload_id: i64,
        #[arg(long, value_enum)]
        phase: PhaseArg,
    },
    /// Void a pending billing attempt at the gateway.
    Void {
        /// Gateway unique id of the attempt.
        unique_id: String,
    },
    /// Cancel a running upload: set the cancellation bit and the status.
    Cancel {
        upload_id: i64,
    },
    /// Add an IBAN to the blacklist.
    BlacklistAdd {
        iban: String,
        #[arg(long, default_value = "manual")]
        reason: String,
        #[arg(long)]
        added_by: Option<String>,
    },
    /// Remove an IBAN from the blacklist.
    BlacklistRemove {
        iban: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "redress=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let config = RedressConfig::load(cli.config.as_deref())?;
    let storage = StorageMode::auto(cli.database_url.clone());
    let state = ServiceState::bootstrap(config, storage).await?;

    match cli.command {
        Command::Serve { listen } => serve(state, listen).await,
        Command::Ingest {
            file,
            model,
            uploader,
            run_phases,
        } => ingest(state, file, model.into(), uploader, run_phases).await,
        Command::Export { out } => export(state, out).await,
        Command::RunPhase { upload_id, phase } => run_phase(state, upload_id, phase).await,
        Command::Void { unique_id } => void(state, unique_id).await,
        Command::Cancel { upload_id } => cancel(state, upload_id).await,
        Command::BlacklistAdd {
            iban,
            reason,
            added_by,
        } => blacklist_add(state, iban, reason, added_by).await,
        Command::BlacklistRemove { iban } => blacklist_remove(state, iban).await,
    }
}

async fn run_phase(state: ServiceState, upload_id: i64, phase: PhaseArg) -> anyhow::Result<()> {
    let enqueued = match phase {
        PhaseArg::Validation => {
            state
                .runner
                .enqueue(Arc::new(redress_validate::ValidationJob {
                    store: state.store.clone(),
                    kv: state.kv.clone(),
                    upload_id,
                }))
                .await
        }
        PhaseArg::Vop => {
            state
                .runner
                .enqueue(Arc::new(redress_vop::VopJob {
                    runner: state.vop.clone(),
                    upload_id,
                }))
                .await
        }
        PhaseArg::Billing => {
            state
                .orchestrator
                .dispatch(upload_id, BillingTarget::All)
                .await?
        }
        PhaseArg::Reconciliation => {
            state
                .runner
                .enqueue(Arc::new(redress_reconcile::ReconcileJob {
                    store: state.store.clone(),
                    kv: state.kv.clone(),
                    gateway: state.gateway.clone(),
                    config: state.config.clone(),
                }))
                .await
        }
    };
    info!(upload_id, ?phase, enqueued, "phase run requested");
    // Leave the workers a window to drain before the process exits.
    tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    Ok(())
}

async fn void(state: ServiceState, unique_id: String) -> anyhow::Result<()> {
    let Some(attempt) = state.store.find_attempt_by_unique_id(&unique_id).await? else {
        anyhow::bail!("no billing attempt with unique id {unique_id}");
    };
    let voided =
        redress_billing::void_attempt(&state.store, &state.gateway, &state.config, &attempt)
            .await?;
    if voided {
        info!(unique_id, "attempt voided");
    } else {
        info!(unique_id, status = attempt.status.as_str(), "attempt not voidable");
    }
    Ok(())
}

async fn cancel(state: ServiceState, upload_id: i64) -> anyhow::Result<()> {
    state
        .kv
        .set(
            &redress_jobs::cancel_key("upload", upload_id),
            "1",
            Some(std::time::Duration::from_secs(24 * 60 * 60)),
        )
        .await;
    state
        .store
        .set_upload_status(upload_id, redress_types::UploadStatus::Cancelled)
        .await?;
    info!(upload_id, "upload cancelled");
    Ok(())
}

async fn blacklist_add(
    state: ServiceState,
    iban: String,
    reason: String,
    added_by: Option<String>,
) -> anyhow::Result<()> {
    let normalized = redress_iban::normalize(&iban);
    let entry = state
        .store
        .add_blacklist_entry(redress_types::NewBlacklistEntry {
            iban_hash: redress_iban::hash(&normalized),
            iban: normalized,
            first_name: None,
            last_name: None,
            email: None,
            reason,
            source: "manual".to_string(),
            added_by,
        })
        .await?;
    info!(entry_id = entry.id, "blacklist entry present");
    Ok(())
}

async fn blacklist_remove(state: ServiceState, iban: String) -> anyhow::Result<()> {
    let hash = redress_iban::hash_raw(&iban);
    let removed = state.store.remove_blacklist_entry(&hash).await?;
    info!(removed, "blacklist removal finished");
    Ok(())
}

async fn serve(state: ServiceState, listen: SocketAddr) -> anyhow::Result<()> {
    let schedulers = spawn_schedulers(&state);
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(listen).await?;
    info!("redressd listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;
    for handle in schedulers {
        handle.abort();
    }
    Ok(())
}

async fn ingest(
    state: ServiceState,
    file: PathBuf,
    model: BillingModel,
    uploader: i64,
    run_phases: bool,
) -> anyhow::Result<()> {
    let filename = file
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload")
        .to_string();
    let upload = state
        .ingestor
        .ingest_file(&file, &filename, uploader, model)
        .await?;
    info!(
        upload_id = upload.id,
        total = upload.total_rows,
        processed = upload.processed_records,
        failed = upload.failed_records,
        status = upload.status.as_str(),
        "upload ingested"
    );

    if run_phases {
        let summary = run_validation(&state.store, &state.kv, upload.id).await?;
        info!(valid = summary.valid, invalid = summary.invalid, "validation finished");
        let scored = run_vop(&state.vop, upload.id).await?;
        info!(scored, "vop finished");
        state
            .orchestrator
            .dispatch(upload.id, BillingTarget::All)
            .await?;
        info!(upload_id = upload.id, "billing batch dispatched");

        // Wait for the batch finally-callback before the process exits.
        for _ in 0..600 {
            let current = state.store.get_upload(upload.id).await?;
            if let Some(current) = current {
                if current.phases.billing != redress_types::PhaseStatus::Started {
                    info!(
                        billing = current.phases.billing.as_str(),
                        "billing batch finished"
                    );
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
        }
    }
    Ok(())
}

async fn export(state: ServiceState, out: PathBuf) -> anyhow::Result<()> {
    let job_id = uuid::Uuid::new_v4().to_string();
    state
        .runner
        .enqueue(Arc::new(CleanUsersExportJob {
            store: state.store.clone(),
            job_id: job_id.clone(),
            out_path: out.clone(),
        }))
        .await;
    info!(job_id, path = %out.display(), "export enqueued");

    let progress_key = format!("clean_users_export:{job_id}");
    for _ in 0..60 {
        if let Some(raw) = state.kv.get(&progress_key).await {
            if raw.contains("\"done\":true") {
                info!(path = %out.display(), "export finished");
                return Ok(());
            }
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }
    anyhow::bail!("export did not finish within 60s")
}
