//! Dockhand Engine - Entry Point
//!
//! Queue-backed deployment orchestration engine. Resolves sources,
//! transforms compose documents and drives Docker on local or remote hosts.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;

use dockhand::logs::{init_logging, LogOptions};
use dockhand::scheduler::Scheduler;
use dockhand::storage::layout::StorageLayout;
use dockhand::storage::settings::Settings;
use dockhand::store::resources::MemoryResourceStore;
use dockhand::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        println!("{}", serde_json::to_string_pretty(&version).unwrap());
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(base_dir) => StorageLayout::new(base_dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file; a missing file means defaults
    let settings_file = layout.settings_file();
    let settings = if settings_file.exists().await {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                error!("Unable to read settings file: {}", e);
                return;
            }
        }
    } else {
        Settings::default()
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        println!("Failed to initialize logging: {e}");
    }

    info!(
        "Starting dockhand engine {} (base dir {})",
        version.version,
        layout.base_dir.display()
    );

    // Until an embedding control plane registers its own store, resources
    // come from the settings-declared servers and an empty in-memory table
    let resources = Arc::new(MemoryResourceStore::new());
    for server in &settings.servers {
        resources.upsert_server(server.clone());
    }

    let scheduler = match Scheduler::new(settings, layout, resources).await {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Failed to initialize the scheduler: {}", e);
            return;
        }
    };
    if let Err(e) = scheduler.start().await {
        error!("Failed to start the scheduler: {}", e);
        return;
    }

    await_shutdown_signal().await;

    warn!("Draining workers...");
    scheduler.shutdown().await;
    info!("Scheduler stopped");
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).unwrap();
        let mut sigint = signal(SignalKind::interrupt()).unwrap();

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
        info!("Ctrl+C received, shutting down...");
    }
}
