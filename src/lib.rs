// src/lib.rs

pub mod api;
pub mod backend;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod filter;
pub mod host;
pub mod logging;
pub mod protocol;
pub mod store;
pub mod target;

use std::collections::BTreeMap;

use anyhow::Result;
use tracing::info;

use crate::backend::BackendRegistry;
use crate::cli::{CliArgs, CliCommand, RunMode};
use crate::config::ConfigFile;
use crate::engine::{run_service, Command, Engine, ServiceOptions};

/// High-level entry point used by `main.rs`. Returns the process exit code.
pub async fn run(args: CliArgs) -> Result<i32> {
    let cfg = resolve_config(args.config.as_deref())?;

    match args.command {
        CliCommand::Info => {
            print_info(&cfg).await?;
            Ok(cli::EXIT_OK)
        }
        CliCommand::Call { term } => {
            eprintln!("no user-defined term registered under {term:?}");
            Ok(cli::EXIT_NOT_IMPLEMENTED)
        }
        CliCommand::Run { mode } => {
            let mut engine = Engine::new(cfg.engine.clone(), BackendRegistry::builtin()).await?;
            match mode {
                RunMode::Step => {
                    let events = engine.step().await?;
                    println!("{}", serde_json::to_string_pretty(&events)?);
                    Ok(cli::EXIT_OK)
                }
                RunMode::Loop { once } => {
                    run_service(&mut engine, ServiceOptions { exit_when_idle: once }).await?;
                    Ok(cli::EXIT_OK)
                }
            }
        }
        CliCommand::Serve => {
            let mut engine = Engine::new(cfg.engine.clone(), BackendRegistry::builtin()).await?;
            let store = engine.store().clone();
            let server_cfg = cfg.server.clone();

            let api = tokio::spawn(async move {
                api::serve(&server_cfg, store, BackendRegistry::builtin()).await
            });

            let loop_result =
                run_service(&mut engine, ServiceOptions { exit_when_idle: false }).await;
            api.abort();
            loop_result?;
            Ok(cli::EXIT_OK)
        }
        CliCommand::Kill { ids } => {
            enqueue_all(&cfg, ids, Command::Kill).await?;
            Ok(cli::EXIT_OK)
        }
        CliCommand::Restart { ids } => {
            enqueue_all(&cfg, ids, Command::Restart).await?;
            Ok(cli::EXIT_OK)
        }
        CliCommand::Activate { ids } => {
            enqueue_all(&cfg, ids, Command::Activate).await?;
            Ok(cli::EXIT_OK)
        }
    }
}

/// `--config` beats `Gridflow.toml` beats pure defaults + environment.
fn resolve_config(explicit: Option<&str>) -> Result<ConfigFile> {
    match explicit {
        Some(path) => Ok(config::load_and_validate(path)?),
        None => {
            let default = config::default_config_path();
            if default.exists() {
                Ok(config::load_and_validate(&default)?)
            } else {
                Ok(config::from_env_only()?)
            }
        }
    }
}

async fn enqueue_all(
    cfg: &ConfigFile,
    ids: Vec<String>,
    make: fn(String) -> Command,
) -> Result<()> {
    tokio::fs::create_dir_all(&cfg.engine.db_root).await?;
    let log_path = cfg.engine.db_root.join("commands.log");
    for id in ids {
        let command = make(id);
        engine::append_command(&log_path, &command).await?;
        info!(command = %command.to_line(), "command appended");
    }
    Ok(())
}

/// `gridflow info`: configuration plus a per-state census of the store.
async fn print_info(cfg: &ConfigFile) -> Result<()> {
    println!("gridflow info");
    println!("  engine.db_root = {}", cfg.engine.db_root.display());
    println!("  engine.idle_delay_ms = {}", cfg.engine.idle_delay_ms);
    println!(
        "  engine.workers = {} total, {} per host, {} sessions per host",
        cfg.engine.workers_total, cfg.engine.workers_per_host, cfg.engine.sessions_per_host
    );
    println!(
        "  engine.deadlines = start {}s, update {}s",
        cfg.engine.start_deadline_secs, cfg.engine.update_deadline_secs
    );
    println!("  server.port = {}", cfg.server.port);
    println!(
        "  server.auth_tokens = {} configured",
        cfg.server.auth_tokens.len()
    );

    let store = store::Store::open(&cfg.engine.db_root).await?;
    let mut census: BTreeMap<&'static str, usize> = BTreeMap::new();
    let ids = store.list_ids().await?;
    for id in &ids {
        if let Some(target) = store.maybe_get(id).await? {
            *census.entry(target.state().name()).or_default() += 1;
        }
    }
    println!();
    println!("targets ({}):", ids.len());
    for (state, count) in census {
        println!("  {state}: {count}");
    }
    Ok(())
}
