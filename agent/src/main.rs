//! Rollout - Entry Point
//!
//! Continuous-deployment agent. Runs as a daemon receiving push webhooks and
//! API triggers, or one-shot from the command line.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use colored::Colorize;
use futures::StreamExt;

use rollout::app::options::AppOptions;
use rollout::app::pipeline;
use rollout::app::run::run;
use rollout::app::state::AppState;
use rollout::deploy::ssh::SshConnector;
use rollout::errors::AgentError;
use rollout::filesys::file::File;
use rollout::ledger::filter::LedgerFilter;
use rollout::ledger::store::Ledger;
use rollout::logs::{init_logging, LogOptions};
use rollout::models::deployment::{DeploymentResult, FinalStatus};
use rollout::storage::layout::StorageLayout;
use rollout::storage::settings::Settings;
use rollout::trigger::receiver::TriggerEvent;
use rollout::utils::version_info;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Exit code for rejected triggers and configuration errors
const EXIT_REJECTED: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
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
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version_info()) {
            Ok(version) => println!("{}", version),
            Err(e) => eprintln!("Unable to render version: {}", e),
        }
        return ExitCode::SUCCESS;
    }

    let layout = match cli_args.get("base-dir") {
        Some(dir) => StorageLayout::new(dir),
        None => StorageLayout::default(),
    };

    // History only reads the ledger
    if cli_args.contains_key("history") {
        return match print_history(&layout, &cli_args).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("{}", e);
                ExitCode::from(EXIT_REJECTED)
            }
        };
    }

    // Retrieve the settings file
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(PathBuf::from(path)),
        None => layout.settings_file(),
    };
    let settings = match settings_file.read_json::<Settings>().await {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!(
                "Unable to read settings file {}: {}",
                settings_file.path().display(),
                e
            );
            return ExitCode::from(EXIT_REJECTED);
        }
    };

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        json_format: settings.log_json,
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    if let Err(e) = settings.validate() {
        error!("Invalid settings: {}", e);
        return ExitCode::from(EXIT_REJECTED);
    }

    let app_state = match AppState::init(&settings, &layout, Arc::new(SshConnector)).await {
        Ok(state) => Arc::new(state),
        Err(e) => {
            error!("Failed to initialize: {}", e);
            return ExitCode::from(EXIT_REJECTED);
        }
    };

    // Run one deployment in the foreground
    if cli_args.contains_key("deploy") {
        return deploy_once(app_state, &cli_args).await;
    }

    // Run the daemon
    let options = AppOptions::from_settings(&settings);
    info!("Running deployment agent with options: {:?}", options);
    if let Err(e) = run(options, app_state, await_shutdown_signal()).await {
        error!("Failed to run the agent: {e}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn deploy_once(app_state: Arc<AppState>, cli_args: &HashMap<String, String>) -> ExitCode {
    let actor = cli_args
        .get("actor")
        .cloned()
        .or_else(|| env::var("USER").ok())
        .unwrap_or_default();
    let event = TriggerEvent::Manual {
        source_ref: cli_args.get("ref").cloned().unwrap_or_default(),
        actor,
        target_host: cli_args.get("host").cloned().unwrap_or_default(),
    };

    let request = match app_state.deployer.accept(event) {
        Ok(request) => request,
        Err(e) => {
            error!("Trigger rejected: {}", e);
            return ExitCode::from(EXIT_REJECTED);
        }
    };

    // Ctrl-C aborts between steps
    let cancel = CancellationToken::new();
    let abort = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, aborting after the current step...");
                cancel.cancel();
            }
        })
    };

    let outcome = app_state.deployer.deploy_with(&request, &cancel).await;
    abort.abort();

    match &outcome {
        Ok(result) => match serde_json::to_string_pretty(result) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Unable to render result: {}", e),
        },
        Err(e) => error!("Deployment {} was not recorded: {}", request.request_id(), e),
    }
    ExitCode::from(pipeline::exit_code(&outcome))
}

async fn print_history(
    layout: &StorageLayout,
    cli_args: &HashMap<String, String>,
) -> Result<(), AgentError> {
    let filter = history_filter(cli_args)?;
    let ledger = Ledger::open_read_only(layout.ledger_file()).await?;
    let as_json = cli_args.contains_key("json");

    let mut entries = Box::pin(ledger.query(filter));
    while let Some(entry) = entries.next().await {
        let entry = entry?;
        if as_json {
            println!("{}", serde_json::to_string(&entry)?);
        } else {
            println!("{}", summary_line(&entry));
        }
    }
    Ok(())
}

fn history_filter(cli_args: &HashMap<String, String>) -> Result<LedgerFilter, AgentError> {
    let mut filter = LedgerFilter {
        host: cli_args.get("host").cloned(),
        ..Default::default()
    };
    if let Some(status) = cli_args.get("status") {
        filter.status = Some(status.parse().map_err(AgentError::ConfigError)?);
    }
    if let Some(since) = cli_args.get("since") {
        filter.since = Some(parse_time(since)?);
    }
    if let Some(until) = cli_args.get("until") {
        filter.until = Some(parse_time(until)?);
    }
    if let Some(limit) = cli_args.get("limit") {
        filter.limit = Some(
            limit
                .parse()
                .map_err(|_| AgentError::ConfigError(format!("Invalid limit: {}", limit)))?,
        );
    }
    Ok(filter)
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, AgentError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AgentError::ConfigError(format!("Invalid time {}: {}", value, e)))
}

fn summary_line(result: &DeploymentResult) -> String {
    let status = match result.final_status {
        FinalStatus::Success => result.final_status.as_str().green(),
        FinalStatus::Failed => result.final_status.as_str().red(),
        FinalStatus::Aborted => result.final_status.as_str().yellow(),
    };
    format!(
        "{} {:<8} {} {} by {} ({} steps) {}",
        result.completed_at.format("%Y-%m-%d %H:%M:%S"),
        status.bold(),
        result.target_host,
        result.source_ref,
        result.triggered_by,
        result.steps.len(),
        result.request_id.dimmed()
    )
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
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
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Ctrl+C received, shutting down...");
    }
}
