//! Command-line driver for a persisted shop store.
//!
//! Every command boots the store (hydrating from the configured storage
//! directory), does its work, flushes the snapshot and exits.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use larder_common::FileConfig;
use larder_engine::Action;
use larder_persist::FileStorage;
use serde_json::Value;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod shop;

use shop::Shop;

#[derive(Parser)]
#[command(name = "larder")]
#[command(about = "Inspect and drive a persisted shop store")]
#[command(version)]
struct Cli {
    /// TOML config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the hydrated state tree
    Show,

    /// Run a query through the cache and print the result
    Fetch {
        endpoint: String,
        /// Query args as JSON
        args: Option<String>,
    },

    /// Run a mutation and print the result
    Mutate {
        endpoint: String,
        /// Mutation args as JSON
        args: Option<String>,
    },

    /// Dispatch an action and print the resulting state
    Dispatch {
        /// Action type, e.g. `auth/loggedIn`
        kind: String,
        /// Payload as JSON
        payload: Option<String>,
    },

    /// Delete the persisted snapshot
    Purge,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("Error: {:#}", e);
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("larder=info".parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = FileConfig::load(cli.config.as_deref())?;
    config.log_summary();

    let fetcher = Arc::new(shop::http_fetcher(&config)?);
    let storage = FileStorage::new(config.persist.storage_dir.clone());
    let shop = Shop::boot(&config, fetcher.clone(), storage).await?;
    shop.track_session(fetcher);

    match cli.command {
        Commands::Show => print_json(&*shop.store.get_state())?,
        Commands::Fetch { endpoint, args } => {
            let data = shop.api.query(&shop.store, &endpoint, parse_json(args)?).await?;
            print_json(&data)?;
        }
        Commands::Mutate { endpoint, args } => {
            let data = shop.api.mutate(&shop.store, &endpoint, parse_json(args)?).await?;
            print_json(&data)?;
        }
        Commands::Dispatch { kind, payload } => {
            let action = Action::new(kind).with_payload(parse_json(payload)?);
            info!(action = action.kind(), "Dispatching");
            shop.store.dispatch(action);
            print_json(&*shop.store.get_state())?;
        }
        Commands::Purge => {
            shop.persistor.purge().await?;
            println!("Purged {}", shop.persistor.config().storage_key());
            return Ok(());
        }
    }

    shop.persistor.flush().await?;
    Ok(())
}

fn parse_json(raw: Option<String>) -> Result<Value> {
    match raw {
        Some(raw) => serde_json::from_str(&raw).with_context(|| format!("Invalid JSON: {raw}")),
        None => Ok(Value::Null),
    }
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
