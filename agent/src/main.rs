//! infragent - Entry Point
//!
//! Conversational infrastructure provisioning orchestrator. Collects template
//! parameters, runs the provisioning tool in the background, recovers from
//! failed applies and hands out connections to the clusters it created.

use std::collections::HashMap;
use std::env;
use std::sync::Arc;
use std::time::Duration;

use colored::Colorize;
use infragent::app::inspect::{cluster_report, status_report};
use infragent::app::options::AppOptions;
use infragent::app::run::run;
use infragent::cluster::cache::ConnectionCache;
use infragent::cluster::connector::HttpClusterConnector;
use infragent::cluster::discovery::ClusterDiscoveryService;
use infragent::filesys::dir::Dir;
use infragent::filesys::file::File;
use infragent::logs::{init_logging, LogOptions};
use infragent::registry::DirectoryRegistry;
use infragent::storage::layout::StorageLayout;
use infragent::storage::settings::{load_settings, Settings};
use infragent::utils::version_info;

use tracing::{error, info};

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
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to render version: {e}"),
        }
        return;
    }

    let layout = match cli_args.get("base-dir") {
        Some(base_dir) => StorageLayout::new(base_dir),
        None => StorageLayout::default(),
    };

    // Retrieve the settings file
    let settings_file = match cli_args.get("settings") {
        Some(path) => File::new(path),
        None => layout.settings_file(),
    };
    let settings = match load_settings(&settings_file).await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Unable to read settings file: {e}");
            return;
        }
    };

    // Offline inspection commands
    if let Some(deployment_id) = cli_args.get("status") {
        if let Err(e) = print_status(&layout, &settings, deployment_id).await {
            eprintln!("{} {:#}", "error:".red().bold(), e);
        }
        return;
    }
    if let Some(hint) = cli_args.get("resolve") {
        let hint = if hint == "true" { None } else { Some(hint.as_str()) };
        if let Err(e) = print_cluster(&layout, &settings, hint).await {
            eprintln!("{} {:#}", "error:".red().bold(), e);
        }
        return;
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.json_logs,
        log_dir: if settings.file_logs {
            Some(layout.logs_dir().path().to_path_buf())
        } else {
            None
        },
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    // Run the orchestrator
    let options = AppOptions::from_settings(layout, &settings);
    info!(
        "Running infragent {} with options: {:?}",
        version.version, options
    );
    if let Err(e) = run(options, await_shutdown_signal()).await {
        error!("Failed to run infragent: {e}");
    }
}

fn open_registry(layout: &StorageLayout, settings: &Settings) -> Arc<DirectoryRegistry> {
    Arc::new(DirectoryRegistry::new(
        layout.deployments_dir(),
        settings.storage.legacy_roots.iter().map(Dir::new).collect(),
    ))
}

async fn print_status(
    layout: &StorageLayout,
    settings: &Settings,
    deployment_id: &str,
) -> anyhow::Result<()> {
    let registry = open_registry(layout, settings);
    print!("{}", status_report(&registry, deployment_id).await?);
    Ok(())
}

async fn print_cluster(
    layout: &StorageLayout,
    settings: &Settings,
    hint: Option<&str>,
) -> anyhow::Result<()> {
    let discovery = ClusterDiscoveryService::new(
        open_registry(layout, settings),
        Arc::new(HttpClusterConnector::new(Duration::from_secs(
            settings.discovery.health_check_timeout_secs,
        ))),
        ConnectionCache::new(
            settings.discovery.cache_capacity,
            Duration::from_secs(settings.discovery.freshness_window_secs),
        ),
    );
    print!("{}", cluster_report(&discovery, hint).await?);
    Ok(())
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    error!("Unable to install signal handlers, waiting for Ctrl+C only");
                    let _ = tokio::signal::ctrl_c().await;
                    return;
                }
            };

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
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
