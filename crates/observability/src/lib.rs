use std::sync::OnceLock;

use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::EnvFilter;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_tracing(service_name: &str) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{service_name}=info,info")));

    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stdout());

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_target(true)
        .with_thread_ids(true)
        .try_init();

    Some(guard)
}

/// Installs the process-wide Prometheus recorder once; later calls return the same handle.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;

    let _ = PROM_HANDLE.set(handle.clone());
    describe_metrics();
    Ok(handle)
}

pub fn describe_metrics() {
    describe_counter!("state.publish_ok", "Snapshots accepted by the game state store");
    describe_counter!(
        "state.publish_stale",
        "Snapshots rejected because their tick did not advance"
    );
    describe_counter!("state.cas_retry", "Optimistic publish retries after a lost CAS");
    describe_counter!("model.stage_ok", "Model candidates staged");
    describe_counter!("model.stage_rejected", "Model candidates rejected at load or validation");
    describe_counter!("model.promote_ok", "Model promotions completed");
    describe_counter!("model.promote_timeout", "Model promotions aborted on drain timeout");
    describe_counter!("model.inference", "Inferences served by the active model");
    describe_counter!("model.lease_timeout", "Model leases not granted within budget");
    describe_counter!("macro.execute", "Macro executions started");
    describe_counter!("macro.reload_ok", "Macro reloads completed");
    describe_counter!("macro.reload_timeout", "Macro reloads aborted on drain timeout");
    describe_counter!("macro.reload_invalid", "Macro reloads rejected by syntax validation");
    describe_counter!("decision.resolved", "Decision cycles resolved by a tier");
    describe_counter!("decision.fallback", "Decision cycles that returned the fallback action");
    describe_counter!("decision.tier_timeout", "Tier invocations that overran their slice");
    describe_counter!("decision.llm_late_discard", "LLM replies dropped for a closed cycle");
    describe_histogram!("decision.latency_ms", Unit::Milliseconds, "Decision cycle latency");
    describe_counter!("cycle.started", "Improvement cycles admitted");
    describe_counter!("cycle.coalesced", "Improvement cycle triggers dropped while one ran");
    describe_counter!("cycle.failed", "Improvement cycles that ended in failure");
    describe_gauge!("cycle.fallback_ratio", "Fallback share of decisions in the last cycle window");
    describe_counter!("lock.order_violation", "Lock acquisitions out of global order");
    describe_counter!("lock.stuck_hold", "Lock holds flagged by the deadlock watchdog");
    describe_gauge!("lock.held", "Tracked locks currently held");
    describe_counter!("bus.publish_unobserved", "Bus events published with no subscriber");
    describe_counter!("runner.outbox_dropped", "Macro commands dropped from a full outbox");
}
