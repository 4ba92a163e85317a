use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use shopfloor::bulk::{BulkOperationOrchestrator, CancelError, OperationType};
use shopfloor::gateway::{ActionGateway, InMemoryStore, StoreFailure};
use shopfloor::shutdown::ShutdownCoordinator;
use shopfloor::telemetry::{init_telemetry, shutdown_telemetry};
use shopfloor::workflow::{available_transitions, Entity, EntityId, TransitionName, WorkflowStateMachine, WorkflowStatus};
use shopfloor::ShopfloorConfig;

#[derive(Parser)]
#[command(name = "shopfloor")]
#[command(about = "Workflow transitions and bulk operations against a scripted in-memory store")]
#[command(long_about = "Shopfloor drives per-entity workflow transitions with optimistic updates and \
                       runs bulk administrative operations with bounded concurrency. Every command \
                       runs against an in-memory store and prints JSON on stdout.")]
struct Cli {
    /// Configuration file (defaults to ./shopfloor.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the transitions available for an entity in the given state
    Transitions {
        #[arg(long, default_value = "pending")]
        status: WorkflowStatus,
        #[arg(long)]
        paid: bool,
        #[arg(long)]
        delivered: bool,
    },
    /// Apply one transition optimistically and report the settled entity
    Transition {
        #[arg(long, default_value = "entity-1")]
        id: String,
        #[arg(long, default_value = "pending")]
        status: WorkflowStatus,
        #[arg(long)]
        paid: bool,
        #[arg(long)]
        delivered: bool,
        #[arg(long)]
        transition: TransitionName,
        /// Make the store call fail this way
        #[arg(long, value_enum)]
        fail: Option<FailureMode>,
        /// Per-call timeout override
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Run a bulk operation and print its final record
    Bulk {
        #[arg(long)]
        operation: OperationType,
        /// Comma-separated target ids
        #[arg(long, value_delimiter = ',', required = true)]
        ids: Vec<String>,
        #[arg(long)]
        concurrency: Option<usize>,
        /// Targets the store rejects
        #[arg(long, value_delimiter = ',')]
        fail_ids: Vec<String>,
        /// Targets the store does not know
        #[arg(long, value_delimiter = ',')]
        missing_ids: Vec<String>,
        /// Simulated store latency per call
        #[arg(long, default_value = "0")]
        latency_ms: u64,
        /// Request cancellation once this many units completed
        #[arg(long)]
        cancel_after: Option<usize>,
        #[arg(long)]
        batch_timeout_ms: Option<u64>,
    },
    /// Print the effective configuration as TOML
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum FailureMode {
    Timeout,
    Rejected,
    Network,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    ShopfloorConfig::load_env_file()?;
    let config = ShopfloorConfig::load_from(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;

    let outcome = match cli.command {
        Commands::Transitions { status, paid, delivered } => {
            let entity = entity_in(EntityId::from("entity-1"), status, paid, delivered);
            let names: Vec<&str> = available_transitions(&entity).into_iter().map(TransitionName::as_str).collect();
            print_json(&names)
        }
        Commands::Transition {
            id,
            status,
            paid,
            delivered,
            transition,
            fail,
            timeout_ms,
        } => {
            let entity = entity_in(EntityId::new(id), status, paid, delivered);
            tokio::runtime::Runtime::new()?.block_on(async {
                transition_command(&config, entity, transition, fail, timeout_ms).await
            })
        }
        Commands::Bulk {
            operation,
            ids,
            concurrency,
            fail_ids,
            missing_ids,
            latency_ms,
            cancel_after,
            batch_timeout_ms,
        } => {
            let mut engine = config.engine.clone();
            if let Some(concurrency) = concurrency {
                engine.concurrency = concurrency;
            }
            if batch_timeout_ms.is_some() {
                engine.batch_timeout_ms = batch_timeout_ms;
            }
            engine.validate()?;

            let store = InMemoryStore::new().with_latency(Duration::from_millis(latency_ms));
            for id in ids.iter().filter(|id| !missing_ids.contains(id)) {
                store.insert_record(id.as_str(), json!({ "id": id }));
            }
            for id in &fail_ids {
                store.fail_always(id.as_str(), StoreFailure::Reject {
                    code: 422,
                    message: "rejected by store".to_string(),
                });
            }

            let targets = ids.into_iter().map(EntityId::from).collect();
            tokio::runtime::Runtime::new()?.block_on(async {
                bulk_command(&engine, Arc::new(store), operation, targets, cancel_after).await
            })
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    };

    shutdown_telemetry();
    outcome
}

/// Builds an entity whose timestamps agree with the requested flags.
fn entity_in(id: EntityId, status: WorkflowStatus, paid: bool, delivered: bool) -> Entity {
    let now = Utc::now();
    let mut entity = Entity::pending(id);
    entity.workflow_status = status;
    if status != WorkflowStatus::Pending {
        entity.approved_at = Some(now);
    }
    let completed = status == WorkflowStatus::Completed;
    if paid || completed {
        entity.is_paid = true;
        entity.payment_confirmed_at = Some(now);
    }
    if delivered || completed {
        entity.is_delivered = true;
        entity.delivery_confirmed_at = Some(now);
    }
    if completed {
        entity.completed_at = Some(now);
    }
    entity
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn transition_command(
    config: &ShopfloorConfig,
    entity: Entity,
    transition: TransitionName,
    fail: Option<FailureMode>,
    timeout_ms: Option<u64>,
) -> Result<()> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_record(entity.id.clone(), serde_json::to_value(&entity)?);
    if let Some(mode) = fail {
        let failure = match mode {
            FailureMode::Timeout => StoreFailure::Hang,
            FailureMode::Rejected => StoreFailure::Reject {
                code: 409,
                message: "record changed remotely".to_string(),
            },
            FailureMode::Network => StoreFailure::Unavailable("connection reset".to_string()),
        };
        store.fail_always(entity.id.clone(), failure);
    }

    let gateway = Arc::new(ActionGateway::from_config(store, &config.engine));
    let mut machine = WorkflowStateMachine::new(gateway);
    if let Some(ms) = timeout_ms {
        machine = machine.with_timeout(Duration::from_millis(ms));
    }

    let pending = machine.begin(&entity, transition)?;
    info!(status = %pending.optimistic.workflow_status, "Showing optimistic state");

    match pending.settle().await {
        Ok(confirmed) => print_json(&json!({ "outcome": "confirmed", "entity": confirmed })),
        Err(error) => match error.restored() {
            Some(restored) => print_json(&json!({
                "outcome": "rolled_back",
                "reason": error.reason(),
                "error": error.to_string(),
                "entity": restored,
            })),
            None => Err(error.into()),
        },
    }
}

async fn bulk_command(
    engine: &shopfloor::EngineConfig,
    store: Arc<InMemoryStore>,
    operation_type: OperationType,
    targets: Vec<EntityId>,
    cancel_after: Option<usize>,
) -> Result<()> {
    let gateway = Arc::new(ActionGateway::from_config(store, engine));
    let orchestrator = Arc::new(BulkOperationOrchestrator::from_config(gateway, engine));
    let tracker = orchestrator.tracker();

    let operation = orchestrator.submit(operation_type, targets, serde_json::Value::Null)?;
    let id = operation.id;

    if let Some(threshold) = cancel_after {
        let mut updates = tracker.watch(id)?;
        let already_finished = updates
            .wait_for(|operation| operation.progress.completed_count >= threshold || operation.is_terminal())
            .await
            .context("operation state closed unexpectedly")?
            .is_terminal();
        if !already_finished {
            match orchestrator.cancel(id) {
                Ok(()) | Err(CancelError::NotCancellable { .. }) => {}
                Err(error) => return Err(error.into()),
            }
        }
    }

    let finished = tokio::select! {
        finished = tracker.wait_for_terminal(id) => finished?,
        signal = ShutdownCoordinator::wait_for_signal() => {
            signal?;
            let report = ShutdownCoordinator::new(orchestrator.clone())
                .shutdown(Duration::from_millis(engine.gateway_timeout_ms))
                .await;
            if !report.is_clean() {
                bail!("{} operation(s) still draining at exit", report.still_running.len());
            }
            orchestrator.result(id).context("operation disappeared during shutdown")?
        }
    };

    print_json(&finished)
}
