//! pop-node: inspect the state of a PoP mining client.
//!
//! Mining itself needs chain transports, which embedders wire up through
//! [`pop_node::Node`]. This binary reads what such a node persisted.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pop_chain::HeaderChain;
use pop_mining::{MiningOperation, OperationId, OperationRepository, OperationStore};
use pop_node::{NodeConfig, Overrides};
use pop_storage::{Database, Storage};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, Level};
use tracing_subscriber::FmtSubscriber;

/// PoP mining client.
#[derive(Parser, Debug)]
#[command(name = "pop-node")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pop-node.toml")]
    config: PathBuf,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show the best header
    Status,
    /// List mining operations
    Operations {
        /// Include completed and failed operations
        #[arg(long)]
        all: bool,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Show one mining operation
    Operation {
        id: String,
        /// Print JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(true)
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    let config = NodeConfig::load(
        &args.config,
        &Overrides {
            data_dir: args.data_dir.clone(),
        },
    )?;
    config.validate()?;
    debug!(data_dir = ?config.data_dir, "Configuration loaded");

    match args.command {
        Command::Status => status(&config),
        Command::Operations { all, json } => operations(&config, all, json),
        Command::Operation { id, json } => operation(&config, &id, json),
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn open_store(config: &NodeConfig) -> Result<Arc<Database>> {
    let path = config.db_path();
    let db = Database::open_read_only(&path)
        .with_context(|| format!("No readable database at {}", path.display()))?;
    Ok(Arc::new(db))
}

fn status(config: &NodeConfig) -> Result<()> {
    let storage = open_store(config)?;
    match HeaderChain::read_tip(storage.as_ref(), config.chain.header_size)? {
        Some(tip) => {
            println!("Best height:     {}", tip.height);
            println!("Best header:     {}", tip.hash);
            println!("Cumulative work: {}", tip.cumulative_work);
            println!("Checkpoint:      {}", tip.checkpoint);
        }
        None => println!("No headers stored yet"),
    }

    let store = OperationStore::new(storage as Arc<dyn Storage>);
    let all = store.list_all()?;
    let active = all.iter().filter(|op| !op.is_terminal()).count();
    println!("Operations:      {} ({} active)", all.len(), active);
    Ok(())
}

fn operations(config: &NodeConfig, all: bool, json: bool) -> Result<()> {
    let store = OperationStore::new(open_store(config)? as Arc<dyn Storage>);
    let operations = if all { store.list_all()? } else { store.list_active()? };

    if json {
        println!("{}", serde_json::to_string_pretty(&operations)?);
        return Ok(());
    }
    if operations.is_empty() {
        println!("No operations");
        return Ok(());
    }
    println!("{:<8}  {:<16}  {:>10}  STATE", "ID", "CHAIN", "HEIGHT");
    for op in &operations {
        println!(
            "{:<8}  {:<16}  {:>10}  {}",
            op.id,
            op.chain_id,
            op.endorsed_height.map(|h| h.to_string()).unwrap_or_else(|| "-".into()),
            op.state
        );
    }
    Ok(())
}

fn operation(config: &NodeConfig, id: &str, json: bool) -> Result<()> {
    let store = OperationStore::new(open_store(config)? as Arc<dyn Storage>);
    let op = store
        .load(&OperationId::from(id))?
        .with_context(|| format!("Operation {id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&op)?);
    } else {
        print_operation(&op);
    }
    Ok(())
}

fn print_operation(op: &MiningOperation) {
    let field = |name: &str, value: Option<String>| {
        if let Some(value) = value {
            println!("{name:<22}{value}");
        }
    };

    field("Id:", Some(op.id.to_string()));
    field("Chain:", Some(op.chain_id.clone()));
    field("State:", Some(op.state.to_string()));
    field("Endorsed height:", op.endorsed_height.map(|h| h.to_string()));
    field("Endorsed block:", op.endorsed_block_hash.clone());
    field("Transaction:", op.transaction_id.clone());
    field("Endorsement block:", op.endorsement_block_hash.map(|h| h.to_string()));
    field("Block of proof:", op.block_of_proof_hash.map(|h| h.to_string()));
    field("Proof submission:", op.proof_submission_id.clone());
    field(
        "Payout:",
        op.payout
            .as_ref()
            .map(|p| format!("{} in {}", p.amount, p.payout_block_hash)),
    );
    field("Failure:", op.failure_reason.clone());

    if !op.stage_attempts.is_empty() {
        println!("Attempts:");
        for (state, attempts) in &op.stage_attempts {
            println!("  {state:<24}{attempts}");
        }
    }
    if !op.log.is_empty() {
        println!("Log:");
        for entry in &op.log {
            println!("  {} {:<5} {}", entry.timestamp, format!("{:?}", entry.level).to_lowercase(), entry.message);
        }
    }
}
