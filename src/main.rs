use anyhow::{Context, Result};
use clap::Parser;
use mcpd::config::Config;
use mcpd::registry::Registry;
use mcpd::{management, proxy, AppState};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "mcpd", about = "MCP reverse proxy and process supervisor", version)]
struct Args {
    /// Port the reverse proxy and management surface listen on.
    #[arg(long, env = "MCPD_PORT")]
    port: Option<u16>,

    /// Directory holding the SQLite registry database and config.toml.
    #[arg(long, env = "MCPD_DATA_DIR")]
    data_dir: Option<std::path::PathBuf>,

    /// Log level filter, e.g. "info", "debug", "mcpd=trace".
    #[arg(long, env = "MCPD_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily), in addition to stdout.
    #[arg(long, env = "MCPD_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = args.log.clone().unwrap_or_else(|| "info".to_string());
    let _log_guard = setup_logging(&log_level, args.log_file.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "mcpd starting");

    let config = Config::new(args.port, args.data_dir, args.log);
    info!(
        data_dir = %config.data_dir.display(),
        port = config.port,
        require_api_key = config.require_api_key,
        environment = %config.environment,
        initial_setup = config.initial_setup,
        "config loaded"
    );
    if config.initial_setup {
        warn!("INITIAL_SETUP=true but the setup wizard is not implemented by this daemon; skipping");
    }

    let registry = Registry::open(&config.data_dir, config.database_url.as_deref())
        .await
        .context("opening service registry")?;

    let state = Arc::new(AppState::new(config, registry));

    state
        .process_manager
        .reconcile()
        .await
        .context("reconciling services at startup")?;

    state.rate_limiter.spawn_sweeper();
    state.cache.spawn_sweeper();

    let addr: SocketAddr = format!("0.0.0.0:{}", state.config.port).parse()?;
    let app = axum::Router::new()
        .nest("/management", management::router(state.clone()).with_state(state.clone()))
        .merge(proxy::router().with_state(state.clone()))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive());

    let has_cert = state.certificate_provider.certificate().await.is_some();
    let external_url = state.external_url_provider.external_url().await;
    info!(
        %addr,
        https = has_cert,
        external_url = external_url.as_deref().unwrap_or("<none>"),
        "listening"
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("shutting down, stopping all supervised services");
    state.process_manager.stop_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => warn!("failed to install SIGTERM handler: {e}"),
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Returns a `WorkerGuard` that must stay alive for the process lifetime.
/// Falls back to stdout-only logging if the log directory can't be created.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    if let Some(path) = log_file {
        let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().unwrap_or_else(|| std::ffi::OsStr::new("mcpd.log"));

        if let Err(e) = std::fs::create_dir_all(dir) {
            eprintln!(
                "warn: could not create log directory '{}': {e} — falling back to stdout",
                dir.display()
            );
            tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
            return None;
        }

        let appender = tracing_appender::rolling::daily(dir, filename);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(log_level.to_string()))
            .with(tracing_subscriber::fmt::layer().compact())
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking))
            .init();

        Some(guard)
    } else {
        tracing_subscriber::fmt().with_env_filter(log_level.to_string()).compact().init();
        None
    }
}
