use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use agent_core::{AgentCore, CoreParts};
use anyhow::{Context, Result};
use core_types::{Action, ActionKind};
use cycle_guard::InMemoryFlag;
use decision_engine::{HttpLlmClient, LlmClient};
use lock_order::LockOrderRegistry;
use macro_registry::MacroDirWatcher;
use model_slot::features::FEATURE_DIM;
use model_slot::{InferenceModel, JsonModelLoader, LinearPolicyModel, ModelLoader, PolicyClass};
use observability::{init_metrics, init_tracing};

use crate::config_loader::{load_runner_config, runner_config_path, RunnerConfig};
use crate::control_api::build_router;
use crate::pdca::PdcaCycle;
use crate::runtime::{spawn_cycle_timer, spawn_event_audit, spawn_macro_watcher, spawn_watchdog};
use crate::state::{AppState, CommandOutbox};

const OUTBOX_CAPACITY: usize = 1_024;

pub(super) async fn async_main() -> Result<()> {
    let _guard = init_tracing("agent_runner");
    let prometheus = init_metrics()?;

    let cfg = load_runner_config();
    tracing::info!(
        path = %runner_config_path().display(),
        bind = %cfg.server.bind,
        workers = cfg.core.workers,
        llm = cfg.llm.enabled,
        "config loaded"
    );

    let locks = LockOrderRegistry::for_build();
    let (state, _tasks) = assemble(&cfg, locks, prometheus)?;

    let addr: SocketAddr = cfg
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address {}", cfg.server.bind))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control api listening");
    axum::serve(listener, build_router(state)).await?;
    Ok(())
}

/// Builds the core and starts every background task. Handles are returned so callers may hold them.
pub(crate) fn assemble(
    cfg: &RunnerConfig,
    locks: LockOrderRegistry,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
) -> Result<(AppState, Vec<tokio::task::JoinHandle<()>>)> {
    let loader: Arc<dyn ModelLoader> = Arc::new(JsonModelLoader);
    let initial: Arc<dyn InferenceModel> = match &cfg.model.initial_path {
        Some(path) => load_initial_model(loader.as_ref(), path)?,
        None => Arc::new(baseline_model()),
    };
    let llm: Option<Arc<dyn LlmClient>> = if cfg.llm.enabled {
        Some(Arc::new(HttpLlmClient::new(&cfg.llm)?))
    } else {
        None
    };

    let parts = CoreParts::new(&cfg.core, locks.clone(), initial, loader, llm);
    let watcher = cfg
        .macros
        .dir
        .as_ref()
        .map(|dir| Arc::new(MacroDirWatcher::new(dir, parts.macros.clone(), &locks)));
    let cycle = Arc::new(PdcaCycle::new(
        parts.decisions.clone(),
        watcher.clone(),
        cfg.cycle.max_fallback_ratio,
        &locks,
    ));
    let events = parts.events.clone();
    let (core, cycle_worker) =
        AgentCore::start(parts, cycle, Arc::new(InMemoryFlag::default()), cfg.core.workers);
    let core = Arc::new(core);

    let mut tasks = vec![
        cycle_worker,
        spawn_event_audit(&events),
        spawn_watchdog(locks.clone(), cfg.watchdog.clone(), events.clone()),
    ];
    if let Some(watcher) = watcher {
        tasks.push(spawn_macro_watcher(watcher, cfg.macros.poll_interval_ms, events));
    }
    if cfg.cycle.enabled {
        tasks.push(spawn_cycle_timer(core.clone(), cfg.cycle.interval_sec));
    }

    let state = AppState {
        core,
        outbox: Arc::new(CommandOutbox::new(OUTBOX_CAPACITY, &locks)),
        prometheus,
        started_at: Instant::now(),
    };
    Ok((state, tasks))
}

fn load_initial_model(loader: &dyn ModelLoader, path: &Path) -> Result<Arc<dyn InferenceModel>> {
    let model = loader
        .load(path)
        .with_context(|| format!("load initial model {}", path.display()))?;
    model
        .validate()
        .with_context(|| format!("validate initial model {}", path.display()))?;
    Ok(model)
}

/// Two equally weighted classes: confidence never exceeds one half, so the ML tier
/// defers until a trained policy is promoted.
pub(crate) fn baseline_model() -> LinearPolicyModel {
    let class = |kind| PolicyClass {
        action: Action::new(kind),
        weights: vec![0.0; FEATURE_DIM],
        bias: 0.0,
    };
    LinearPolicyModel {
        name: "baseline".to_string(),
        classes: vec![class(ActionKind::None), class(ActionKind::Sit)],
    }
}
