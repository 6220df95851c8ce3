use std::fs;
use std::path::PathBuf;

use agent_core::CoreConfig;
use core_types::ActionKind;
use decision_engine::LlmConfig;
use lock_order::WatchdogConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct ModelBootConfig {
    /// Policy file promoted at startup; a built-in baseline is used when unset.
    pub initial_path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MacroWatchConfig {
    pub dir: Option<PathBuf>,
    pub poll_interval_ms: u64,
}

impl Default for MacroWatchConfig {
    fn default() -> Self {
        Self {
            dir: Some(PathBuf::from("macros")),
            poll_interval_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CycleConfig {
    pub enabled: bool,
    pub interval_sec: u64,
    /// Fallback share of decisions above which Check reports the window as degraded.
    pub max_fallback_ratio: f64,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_sec: 600,
            max_fallback_ratio: 0.5,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:9901".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct RunnerConfig {
    pub core: CoreConfig,
    pub model: ModelBootConfig,
    pub macros: MacroWatchConfig,
    pub cycle: CycleConfig,
    pub watchdog: WatchdogConfig,
    pub server: ServerConfig,
    pub llm: LlmConfig,
}

#[derive(Debug, Deserialize, Default)]
struct RunnerFile {
    decision: Option<DecisionSection>,
    model: Option<ModelSection>,
    macros: Option<MacrosSection>,
    cycle: Option<CycleSection>,
    watchdog: Option<WatchdogSection>,
    server: Option<ServerSection>,
    llm: Option<LlmSection>,
}

#[derive(Debug, Deserialize, Default)]
struct DecisionSection {
    reflex_threshold: Option<f64>,
    rule_threshold: Option<f64>,
    ml_threshold: Option<f64>,
    llm_threshold: Option<f64>,
    reflex_slice_ms: Option<u64>,
    rule_slice_ms: Option<u64>,
    ml_slice_ms: Option<u64>,
    llm_slice_ms: Option<u64>,
    routine_deadline_ms: Option<u64>,
    emergency_deadline_ms: Option<u64>,
    emergency_hp_ratio: Option<f64>,
    fallback_action: Option<ActionKind>,
    min_llm_interval_ms: Option<u64>,
    model_lease_wait_ms: Option<u64>,
    llm_prompt: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ModelSection {
    initial_path: Option<String>,
    drain_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct MacrosSection {
    dir: Option<String>,
    poll_interval_ms: Option<u64>,
    reload_timeout_ms: Option<u64>,
    reload_slice_ms: Option<u64>,
    reload_backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct CycleSection {
    enabled: Option<bool>,
    interval_sec: Option<u64>,
    max_fallback_ratio: Option<f64>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchdogSection {
    stuck_threshold_ms: Option<u64>,
    sample_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ServerSection {
    bind: Option<String>,
    workers: Option<usize>,
    event_capacity: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct LlmSection {
    enabled: Option<bool>,
    base_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
}

pub(crate) fn runner_config_path() -> PathBuf {
    std::env::var("AGENT_CONFIG_PATH")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("configs/agent.toml"))
}

pub(crate) fn load_runner_config() -> RunnerConfig {
    let path = runner_config_path();
    let mut cfg = match fs::read_to_string(&path) {
        Ok(raw) => parse_runner_config(&raw),
        Err(err) => {
            tracing::warn!(path = %path.display(), error = %err, "config file unreadable; using defaults");
            RunnerConfig::default()
        }
    };
    apply_env_overrides(
        &mut cfg,
        std::env::var("AGENT_BIND").ok(),
        std::env::var("AGENT_WORKERS").ok(),
    );
    cfg
}

pub(crate) fn parse_runner_config(raw: &str) -> RunnerConfig {
    let parsed = match toml::from_str::<RunnerFile>(raw) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::warn!(error = %err, "config file invalid; using defaults");
            return RunnerConfig::default();
        }
    };
    let mut cfg = RunnerConfig::default();
    if let Some(section) = parsed.decision {
        apply_decision(&mut cfg.core, section);
    }
    if let Some(section) = parsed.model {
        if let Some(v) = section.initial_path {
            cfg.model.initial_path = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = section.drain_timeout_ms {
            cfg.core.model.drain_timeout_ms = v.clamp(100, 300_000);
        }
    }
    if let Some(section) = parsed.macros {
        if let Some(v) = section.dir {
            cfg.macros.dir = (!v.trim().is_empty()).then(|| PathBuf::from(v));
        }
        if let Some(v) = section.poll_interval_ms {
            cfg.macros.poll_interval_ms = v.clamp(100, 600_000);
        }
        if let Some(v) = section.reload_timeout_ms {
            cfg.core.macros.reload_timeout_ms = v.clamp(100, 300_000);
        }
        if let Some(v) = section.reload_slice_ms {
            cfg.core.macros.reload_slice_ms = v.clamp(1, 1_000);
        }
        if let Some(v) = section.reload_backoff_ms {
            cfg.core.macros.reload_backoff_ms = v.min(1_000);
        }
    }
    if let Some(section) = parsed.cycle {
        if let Some(v) = section.enabled {
            cfg.cycle.enabled = v;
        }
        if let Some(v) = section.interval_sec {
            cfg.cycle.interval_sec = v.clamp(1, 86_400);
        }
        if let Some(v) = section.max_fallback_ratio {
            cfg.cycle.max_fallback_ratio = v.clamp(0.0, 1.0);
        }
    }
    if let Some(section) = parsed.watchdog {
        if let Some(v) = section.stuck_threshold_ms {
            cfg.watchdog.stuck_threshold_ms = v.clamp(100, 600_000);
        }
        if let Some(v) = section.sample_interval_ms {
            cfg.watchdog.sample_interval_ms = v.clamp(10, 60_000);
        }
    }
    if let Some(section) = parsed.server {
        if let Some(v) = section.bind {
            cfg.server.bind = v;
        }
        if let Some(v) = section.workers {
            cfg.core.workers = v.clamp(1, 64);
        }
        if let Some(v) = section.event_capacity {
            cfg.core.event_capacity = v.clamp(16, 65_536);
        }
    }
    if let Some(section) = parsed.llm {
        if let Some(v) = section.enabled {
            cfg.llm.enabled = v;
        }
        if let Some(v) = section.base_url {
            cfg.llm.base_url = v.trim_end_matches('/').to_string();
        }
        if let Some(v) = section.connect_timeout_ms {
            cfg.llm.connect_timeout_ms = v.clamp(100, 60_000);
        }
        if let Some(v) = section.request_timeout_ms {
            cfg.llm.request_timeout_ms = v.clamp(100, 300_000);
        }
    }
    cfg
}

fn apply_decision(core: &mut CoreConfig, section: DecisionSection) {
    let d = &mut core.decision;
    if let Some(v) = section.reflex_threshold {
        d.thresholds.reflex = v.clamp(0.0, 1.0);
    }
    if let Some(v) = section.rule_threshold {
        d.thresholds.rule = v.clamp(0.0, 1.0);
    }
    if let Some(v) = section.ml_threshold {
        d.thresholds.ml = v.clamp(0.0, 1.0);
    }
    if let Some(v) = section.llm_threshold {
        d.thresholds.llm = v.clamp(0.0, 1.0);
    }
    if let Some(v) = section.reflex_slice_ms {
        d.slices.reflex_ms = v.clamp(1, 1_000);
    }
    if let Some(v) = section.rule_slice_ms {
        d.slices.rule_ms = v.clamp(1, 1_000);
    }
    if let Some(v) = section.ml_slice_ms {
        d.slices.ml_ms = v.clamp(1, 1_000);
    }
    if let Some(v) = section.llm_slice_ms {
        d.slices.llm_ms = v.clamp(1, 10_000);
    }
    if let Some(v) = section.routine_deadline_ms {
        d.routine_deadline_ms = v.clamp(10, 10_000);
    }
    if let Some(v) = section.emergency_deadline_ms {
        d.emergency_deadline_ms = v.clamp(5, 10_000);
    }
    if let Some(v) = section.emergency_hp_ratio {
        d.emergency_hp_ratio = v.clamp(0.0, 1.0);
    }
    if let Some(v) = section.fallback_action {
        d.fallback_action = core_types::Action::new(v);
    }
    if let Some(v) = section.min_llm_interval_ms {
        d.min_llm_interval_ms = v;
    }
    if let Some(v) = section.model_lease_wait_ms {
        d.model_lease_wait_ms = v.min(1_000);
    }
    if let Some(v) = section.llm_prompt {
        if !v.trim().is_empty() {
            d.llm_prompt = v;
        }
    }
}

fn apply_env_overrides(cfg: &mut RunnerConfig, bind: Option<String>, workers: Option<String>) {
    if let Some(v) = bind.filter(|v| !v.trim().is_empty()) {
        cfg.server.bind = v.trim().to_string();
    }
    match workers.map(|v| v.trim().parse::<usize>()) {
        Some(Ok(v)) => cfg.core.workers = v.clamp(1, 64),
        Some(Err(err)) => tracing::warn!(error = %err, "AGENT_WORKERS is not a number; ignored"),
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        assert_eq!(parse_runner_config(""), RunnerConfig::default());
    }

    #[test]
    fn invalid_toml_falls_back_to_defaults() {
        assert_eq!(parse_runner_config("[decision\nrule_threshold = "), RunnerConfig::default());
    }

    #[test]
    fn sections_fold_onto_defaults_with_clamps() {
        let cfg = parse_runner_config(
            r#"
            [decision]
            rule_threshold = 0.65
            ml_threshold = 1.7
            routine_deadline_ms = 1
            fallback_action = "sit"
            min_llm_interval_ms = 0

            [model]
            initial_path = "models/policy.json"

            [macros]
            dir = ""
            reload_timeout_ms = 5000

            [cycle]
            interval_sec = 0

            [watchdog]
            stuck_threshold_ms = 2500

            [server]
            bind = "0.0.0.0:9000"
            workers = 500

            [llm]
            enabled = true
            base_url = "http://llm.local:9902/"
            request_timeout_ms = 1
            "#,
        );
        let d = &cfg.core.decision;
        assert_eq!(d.thresholds.rule, 0.65);
        assert_eq!(d.thresholds.ml, 1.0);
        assert_eq!(d.thresholds.reflex, 0.9);
        assert_eq!(d.routine_deadline_ms, 10);
        assert_eq!(d.fallback_action.kind, ActionKind::Sit);
        assert_eq!(d.min_llm_interval_ms, 0);
        assert_eq!(cfg.model.initial_path, Some(PathBuf::from("models/policy.json")));
        assert_eq!(cfg.macros.dir, None);
        assert_eq!(cfg.core.macros.reload_timeout_ms, 5_000);
        assert_eq!(cfg.cycle.interval_sec, 1);
        assert_eq!(cfg.watchdog.stuck_threshold_ms, 2_500);
        assert_eq!(cfg.watchdog.sample_interval_ms, 1_000);
        assert_eq!(cfg.server.bind, "0.0.0.0:9000");
        assert_eq!(cfg.core.workers, 64);
        assert!(cfg.llm.enabled);
        assert_eq!(cfg.llm.base_url, "http://llm.local:9902");
        assert_eq!(cfg.llm.request_timeout_ms, 100);
    }

    #[test]
    fn env_overrides_bind_and_workers() {
        let mut cfg = RunnerConfig::default();
        apply_env_overrides(&mut cfg, Some(" 127.0.0.1:7000 ".to_string()), Some("3".to_string()));
        assert_eq!(cfg.server.bind, "127.0.0.1:7000");
        assert_eq!(cfg.core.workers, 3);

        apply_env_overrides(&mut cfg, Some(String::new()), Some("many".to_string()));
        assert_eq!(cfg.server.bind, "127.0.0.1:7000");
        assert_eq!(cfg.core.workers, 3);
    }
}
