//! Process-wide component health registry, exposed via `GET /health` and the
//! daemon state file.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: &'static str,
    pub updated_at: DateTime<Utc>,
    pub last_ok: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub restart_count: u64,
}

impl ComponentHealth {
    fn new() -> Self {
        Self {
            status: "starting",
            updated_at: Utc::now(),
            last_ok: None,
            last_error: None,
            restart_count: 0,
        }
    }
}

struct Registry {
    started_at: DateTime<Utc>,
    components: Mutex<BTreeMap<String, ComponentHealth>>,
}

fn registry() -> &'static Registry {
    static REGISTRY: OnceLock<Registry> = OnceLock::new();
    REGISTRY.get_or_init(|| Registry {
        started_at: Utc::now(),
        components: Mutex::new(BTreeMap::new()),
    })
}

fn upsert(component: &str, update: impl FnOnce(&mut ComponentHealth)) {
    let mut map = registry().components.lock();
    let entry = map
        .entry(component.to_string())
        .or_insert_with(ComponentHealth::new);
    update(entry);
    entry.updated_at = Utc::now();
}

pub fn mark_component_ok(component: &str) {
    upsert(component, |entry| {
        entry.status = "ok";
        entry.last_ok = Some(Utc::now());
    });
}

pub fn mark_component_error(component: &str, error: impl ToString) {
    let error = error.to_string();
    upsert(component, move |entry| {
        entry.status = "error";
        entry.last_error = Some(error);
    });
}

pub fn bump_component_restart(component: &str) {
    upsert(component, |entry| {
        entry.restart_count = entry.restart_count.saturating_add(1);
    });
}

pub fn component(component: &str) -> Option<ComponentHealth> {
    registry().components.lock().get(component).cloned()
}

pub fn snapshot_json() -> serde_json::Value {
    let registry = registry();
    let components = registry.components.lock().clone();
    serde_json::json!({
        "pid": std::process::id(),
        "started_at": registry.started_at.to_rfc3339(),
        "uptime_seconds": (Utc::now() - registry.started_at).num_seconds(),
        "components": components,
    })
}
