use crate::channels::MessageTransport;
use crate::compose::NotificationComposer;
use crate::config::Config;
use crate::coordinator::{Coordinator, CoordinatorDeps, CoordinatorSettings, SqliteSnapshotStore};
use crate::dispatch::Dispatcher;
use crate::gateway::AppState;
use crate::store::{SqliteMessageRecordStore, SqliteSubscriptionStore};
use crate::timers::{SqliteTimerService, TimerService};
use anyhow::Result;
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

const STATUS_FLUSH_SECONDS: u64 = 5;

/// Long-lived services shared by the gateway and the timer scheduler.
pub struct Runtime {
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<Dispatcher>,
    pub timers: Arc<dyn TimerService>,
}

/// Wire the SQLite stores, `transport` and the coordinator for `config`.
pub fn build_runtime(config: &Config, transport: Arc<dyn MessageTransport>) -> Runtime {
    let db_path = config.state_db_path();
    let subscriptions = Arc::new(SqliteSubscriptionStore::new(&db_path));
    let timers: Arc<dyn TimerService> = Arc::new(SqliteTimerService::new(&db_path));

    let coordinator = Arc::new(Coordinator::new(
        CoordinatorDeps {
            records: Arc::new(SqliteMessageRecordStore::new(&db_path)),
            snapshots: Arc::new(SqliteSnapshotStore::new(&db_path)),
            subscriptions: subscriptions.clone(),
            timers: Arc::clone(&timers),
            transport,
            composer: NotificationComposer::new(&config.composer),
        },
        CoordinatorSettings::from_config(&config.coordinator),
    ));
    let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&coordinator), subscriptions));

    Runtime {
        coordinator,
        dispatcher,
        timers,
    }
}

pub async fn run(config: Config, host: String, port: u16) -> Result<()> {
    let initial_backoff = config.reliability.component_initial_backoff_secs.max(1);
    let max_backoff = config
        .reliability
        .component_max_backoff_secs
        .max(initial_backoff);

    crate::health::mark_component_ok("daemon");

    let transport = crate::channels::build_transport(&config)?;
    if transport.health_check().await {
        crate::health::mark_component_ok("transport");
    } else {
        crate::health::mark_component_error("transport", "health check failed at startup");
        tracing::warn!(transport = transport.name(), "Transport health check failed; continuing");
    }

    let runtime = build_runtime(&config, transport);
    let report = runtime.coordinator.recover().await?;
    tracing::info!(
        rearmed = report.rearmed,
        expired = report.expired,
        "Coordinator recovered"
    );

    let mut handles: Vec<JoinHandle<()>> = vec![spawn_state_writer(config.clone())];

    {
        let state = AppState::new(
            Arc::clone(&runtime.dispatcher),
            config.gateway.webhook_secret.as_deref(),
        );
        let gateway_host = host.clone();
        handles.push(spawn_component_supervisor(
            "gateway",
            initial_backoff,
            max_backoff,
            move || {
                let state = state.clone();
                let host = gateway_host.clone();
                async move { crate::gateway::run_gateway(&host, port, state).await }
            },
        ));
    }

    {
        let timers_cfg = config.timers.clone();
        let coordinator = Arc::clone(&runtime.coordinator);
        let timers = Arc::clone(&runtime.timers);
        handles.push(spawn_component_supervisor(
            "timers",
            initial_backoff,
            max_backoff,
            move || {
                let cfg = timers_cfg.clone();
                let coordinator = Arc::clone(&coordinator);
                let timers = Arc::clone(&timers);
                async move { crate::timers::scheduler::run(cfg, coordinator, timers).await }
            },
        ));
    }

    println!("duocast daemon started");
    println!("   Gateway:  http://{host}:{port}");
    println!("   Components: gateway, timers");
    println!("   Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    crate::health::mark_component_error("daemon", "shutdown requested");

    for handle in &handles {
        handle.abort();
    }
    for handle in handles {
        let _ = handle.await;
    }

    Ok(())
}

pub fn state_file_path(config: &Config) -> PathBuf {
    config
        .config_path
        .parent()
        .map_or_else(|| PathBuf::from("."), PathBuf::from)
        .join("daemon_state.json")
}

fn spawn_state_writer(config: Config) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = state_file_path(&config);
        let mut interval = tokio::time::interval(Duration::from_secs(STATUS_FLUSH_SECONDS));
        loop {
            interval.tick().await;
            if let Err(e) = write_state_file(&path).await {
                tracing::debug!(path = %path.display(), "Failed to write daemon state: {e}");
            }
        }
    })
}

async fn write_state_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut json = crate::health::snapshot_json();
    if let Some(obj) = json.as_object_mut() {
        obj.insert(
            "written_at".into(),
            serde_json::json!(Utc::now().to_rfc3339()),
        );
    }
    let data = serde_json::to_vec_pretty(&json).unwrap_or_else(|_| b"{}".to_vec());
    tokio::fs::write(path, data).await
}

fn spawn_component_supervisor<F, Fut>(
    name: &'static str,
    initial_backoff_secs: u64,
    max_backoff_secs: u64,
    mut run_component: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = initial_backoff_secs.max(1);
        let max_backoff = max_backoff_secs.max(backoff);

        loop {
            crate::health::mark_component_ok(name);
            match run_component().await {
                Ok(()) => {
                    crate::health::mark_component_error(name, "component exited unexpectedly");
                    tracing::warn!("Daemon component '{name}' exited unexpectedly");
                    // Clean exit resets the backoff
                    backoff = initial_backoff_secs.max(1);
                }
                Err(e) => {
                    crate::health::mark_component_error(name, e.to_string());
                    tracing::error!("Daemon component '{name}' failed: {e}");
                }
            }

            crate::health::bump_component_restart(name);
            tokio::time::sleep(Duration::from_secs(backoff)).await;
            // Double backoff AFTER sleeping so first error uses initial_backoff
            backoff = backoff.saturating_mul(2).min(max_backoff);
        }
    })
}
