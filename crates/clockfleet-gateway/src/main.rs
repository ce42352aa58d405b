use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use clockfleet_controller::{spawn_report_router, DeviceController};
use clockfleet_core::config::ClockfleetConfig;
use clockfleet_core::{ClockfleetError, SystemClock};
use clockfleet_devices::DeviceStore;
use clockfleet_link::{spawn_link_loop, MqttLink};
use clockfleet_scheduler::{ScheduleStore, SchedulerEngine, SchedulerHandle};
use rusqlite::Connection;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

mod app;
mod events;
mod http;

/// Clock fleet gateway: device link, trigger scheduler and health endpoint.
#[derive(Debug, Parser)]
#[command(name = "clockfleet-gateway", version, about)]
struct Cli {
    /// Config file (falls back to CLOCKFLEET_CONFIG, then ~/.clockfleet/clockfleet.toml).
    #[arg(long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "clockfleet_gateway=info,clockfleet_controller=info,clockfleet_scheduler=info,tower_http=debug"
                    .into()
            }),
        )
        .init();

    // config: --config > CLOCKFLEET_CONFIG env > ~/.clockfleet/clockfleet.toml
    let cli = Cli::parse();
    let config_path = cli.config.or_else(|| std::env::var("CLOCKFLEET_CONFIG").ok());
    let config = ClockfleetConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        ClockfleetConfig::default()
    });

    // one SQLite file, one connection per subsystem
    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path)?;
    info!(path = %db_path, "opening SQLite database");
    let db = open_db(&db_path)?;
    db.execute_batch("PRAGMA journal_mode=WAL;")?;
    clockfleet_devices::db::init_db(&db)?;
    clockfleet_scheduler::db::init_db(&db)?;
    drop(db);
    info!("database migrations complete");

    let clock = Arc::new(SystemClock);
    let devices = Arc::new(DeviceStore::new(open_db(&db_path)?)?);
    let scheduler = SchedulerHandle::new(ScheduleStore::new(open_db(&db_path)?)?, clock.clone());

    // Re-arm persisted triggers before anything can schedule new ones.
    let report = scheduler.recover()?;
    if report.undecodable > 0 {
        warn!(count = report.undecodable, "some triggers could not be decoded and were failed");
    }

    let broadcaster = Arc::new(events::EventBroadcaster::new());
    let (link, eventloop) = MqttLink::new(&config.mqtt);
    let controller = Arc::new(DeviceController::new(
        devices.clone(),
        scheduler.clone(),
        Arc::new(link.clone()),
        broadcaster.clone(),
        clock,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let (reports_tx, reports_rx) = mpsc::channel(config.mqtt.channel_capacity);
    let link_task = spawn_link_loop(link, eventloop, reports_tx, shutdown_rx.clone());
    spawn_report_router(controller.clone(), reports_rx);
    info!(
        host = %config.mqtt.host,
        port = config.mqtt.port,
        prefix = %config.mqtt.topic_prefix,
        "mqtt link started"
    );

    spawn_event_log(broadcaster.subscribe());

    let engine = SchedulerEngine::new(scheduler.clone(), controller, config.scheduler.max_sleep_ms);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let state = Arc::new(app::AppState {
        devices,
        scheduler,
        broadcaster,
    });
    let router = app::build_router(state);

    let addr: SocketAddr = format!("{}:{}", config.http.bind, config.http.port).parse()?;
    info!("clockfleet gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // signal background loops to stop
    let _ = shutdown_tx.send(true);
    if let Err(e) = engine_task.await {
        error!("scheduler engine task failed: {e}");
    }
    if let Err(e) = link_task.await {
        error!("mqtt link task failed: {e}");
    }
    info!("clockfleet gateway stopped");
    Ok(())
}

/// Open a connection with the pragmas every subsystem relies on.
fn open_db(path: &str) -> clockfleet_core::Result<Connection> {
    let conn = Connection::open(path).map_err(|e| ClockfleetError::Database(e.to_string()))?;
    conn.execute_batch("PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")
        .map_err(|e| ClockfleetError::Database(e.to_string()))?;
    Ok(conn)
}

fn ensure_parent_dir(path: &str) -> clockfleet_core::Result<()> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Trace every status event at debug level.
fn spawn_event_log(mut events: broadcast::Receiver<String>) {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(frame) => debug!(%frame, "status event"),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event log lagging")
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("ctrl-c handler failed: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
