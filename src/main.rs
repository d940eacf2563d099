mod cli;

use anyhow::Context;
use ares_mcp::{
    api::routes,
    utils::toml_config::{HubConfig, LogFormat},
    AppState, HubConfigManager,
};
use clap::Parser;
use cli::{output::Output, probe, Cli, Commands};
use std::{path::Path, process::ExitCode, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let output = if cli.no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    let result = match &cli.command {
        None | Some(Commands::Serve) => serve(&cli, &output).await,
        Some(Commands::Config { full, validate }) => show_config(&cli.config, *full, *validate, &output),
        Some(Commands::Probe { url, timeout_ms }) => run_probe(url, *timeout_ms, &output).await,
        #[cfg(feature = "mcp")]
        Some(Commands::Mcp) => run_mcp(&cli).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            output.error(&format!("{:#}", e));
            ExitCode::FAILURE
        }
    }
}

/// Logs go to stderr so stdout stays free for CLI output and the MCP transport.
fn init_tracing(cli: &Cli, config: &HubConfig) {
    let level = if cli.verbose {
        "debug"
    } else {
        config.server.log_level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "ares_mcp={level},ares_mcp_server={level},tower_http=info"
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json || config.server.log_format == LogFormat::Json {
        let _ = registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init();
    } else {
        let _ = registry
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init();
    }
}

fn load_manager(cli: &Cli) -> anyhow::Result<HubConfigManager> {
    HubConfigManager::new_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))
}

fn log_warnings(config: &HubConfig) {
    if let Ok(warnings) = config.validate_with_warnings() {
        for warning in warnings {
            warn!("{}", warning);
        }
    }
}

async fn serve(cli: &Cli, output: &Output) -> anyhow::Result<ExitCode> {
    let mut manager = load_manager(cli)?;
    let config = manager.config();
    init_tracing(cli, &config);
    log_warnings(&config);

    if config.server.hot_reload {
        manager
            .start_watching()
            .context("failed to watch configuration file")?;
        info!("Watching {:?} for changes", manager.config_path());
    }

    let state = AppState::new(Arc::new(manager));
    let hub = Arc::clone(&state.hub);
    hub.start();

    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    let local = listener.local_addr()?;
    output.banner(&local.to_string());
    info!(%local, "Hub listening");

    axum::serve(listener, routes::app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    hub.shutdown();
    info!("Hub stopped");
    Ok(ExitCode::SUCCESS)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

fn show_config(
    path: &Path,
    full: bool,
    validate: bool,
    output: &Output,
) -> anyhow::Result<ExitCode> {
    let config = if path.exists() {
        HubConfig::load_with_env(path)
    } else {
        output.warning(&format!(
            "{} not found, showing defaults and environment",
            path.display()
        ));
        HubConfig::from_env()
    };
    let config = match config {
        Ok(config) => config,
        Err(e) => {
            output.error(&e.to_string());
            return Ok(ExitCode::FAILURE);
        }
    };

    if full {
        print!("{}", config.to_toml()?);
        return Ok(ExitCode::SUCCESS);
    }

    output.header("Server");
    output.kv("bind", &config.server.bind_addr());
    output.kv("max_connections", &config.server.max_connections.to_string());
    output.kv("log_level", &config.server.log_level);

    output.header("Dispatch");
    output.kv("strategy", &config.dispatch.strategy.to_string());
    output.kv("task_timeout", &format!("{}s", config.dispatch.task_timeout_secs));
    output.kv("retry_attempts", &config.dispatch.retry_attempts.to_string());
    output.kv(
        "circuit_breaker",
        &if config.circuit_breaker.enabled {
            format!("on (threshold {})", config.circuit_breaker.failure_threshold)
        } else {
            "off".to_string()
        },
    );

    output.header("Pipeline");
    output.table_header(&["Stage", "Capability", "Agent type"]);
    for stage in &config.pipeline.stages {
        let agent_type = stage.agent_type.map(|t| t.to_string()).unwrap_or_else(|| "any".into());
        output.table_row(&[&stage.name, &stage.capability, &agent_type]);
    }

    if validate {
        output.header("Validation");
        let warnings = config.validate_with_warnings()?;
        if warnings.is_empty() {
            output.success("Configuration is valid");
        } else {
            for warning in &warnings {
                output.warning(&warning.to_string());
            }
        }
    } else {
        output.hint("Run with --validate to check for problems, --full for the TOML");
    }

    Ok(ExitCode::SUCCESS)
}

async fn run_probe(url: &str, timeout_ms: u64, output: &Output) -> anyhow::Result<ExitCode> {
    match probe::probe(url, Duration::from_millis(timeout_ms)).await {
        Ok(report) => {
            let reply = if report.pong { "pong" } else { "reply" };
            output.success(&format!(
                "{} from {} in {} ms",
                reply,
                url,
                report.latency.as_millis()
            ));
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            output.error(&e.to_string());
            Ok(ExitCode::FAILURE)
        }
    }
}

/// Runs the hub with its WebSocket listener in the background and serves
/// MCP tools on stdio until the client goes away.
#[cfg(feature = "mcp")]
async fn run_mcp(cli: &Cli) -> anyhow::Result<ExitCode> {
    let manager = load_manager(cli)?;
    let config = manager.config();
    init_tracing(cli, &config);
    log_warnings(&config);

    let state = AppState::new(Arc::new(manager));
    let hub = Arc::clone(&state.hub);
    hub.start();

    let addr = config.server.bind_addr();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    info!(addr = %listener.local_addr()?, "Hub listening for agents");
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, routes::app(state)).await {
            warn!("WebSocket listener stopped: {}", e);
        }
    });

    let result = ares_mcp::mcp::start_stdio_server(Arc::clone(&hub)).await;
    server.abort();
    hub.shutdown();
    result?;
    Ok(ExitCode::SUCCESS)
}
