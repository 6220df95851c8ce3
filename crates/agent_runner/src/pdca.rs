use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use cycle_guard::{CycleContext, ImprovementCycle};
use decision_engine::{DecisionCoordinator, DecisionStatsSnapshot};
use lock_order::{LockLevel, LockOrderRegistry, OrderedMutex};
use macro_registry::MacroDirWatcher;

/// Plan reads decision statistics, Do rescans the macro directory, Check scores
/// the fallback ratio since the previous cycle, Act reports the verdict.
pub(crate) struct PdcaCycle {
    decisions: Arc<DecisionCoordinator>,
    watcher: Option<Arc<MacroDirWatcher>>,
    max_fallback_ratio: f64,
    baseline: OrderedMutex<Option<DecisionStatsSnapshot>>,
}

impl PdcaCycle {
    pub fn new(
        decisions: Arc<DecisionCoordinator>,
        watcher: Option<Arc<MacroDirWatcher>>,
        max_fallback_ratio: f64,
        locks: &LockOrderRegistry,
    ) -> Self {
        Self {
            decisions,
            watcher,
            max_fallback_ratio,
            baseline: OrderedMutex::new(LockLevel::Metrics, "pdca.baseline", locks, None),
        }
    }
}

/// Totals and fallbacks since `previous`; the whole history when there is none.
fn window(current: &DecisionStatsSnapshot, previous: Option<&DecisionStatsSnapshot>) -> (u64, u64) {
    match previous {
        Some(prev) => (
            current.total.saturating_sub(prev.total),
            current.fallbacks.saturating_sub(prev.fallbacks),
        ),
        None => (current.total, current.fallbacks),
    }
}

#[async_trait]
impl ImprovementCycle for PdcaCycle {
    async fn plan(&self, ctx: &mut CycleContext) -> Result<()> {
        let stats = self.decisions.stats();
        let previous = self.baseline.lock().clone();
        let (total, fallbacks) = window(&stats, previous.as_ref());
        ctx.note("window_total", total.to_string());
        ctx.note("window_fallbacks", fallbacks.to_string());
        for (tier, tier_stats) in &stats.tiers {
            ctx.note(&format!("resolved_{tier}"), tier_stats.resolved.to_string());
        }
        *self.baseline.lock() = Some(stats);
        Ok(())
    }

    async fn execute(&self, ctx: &mut CycleContext) -> Result<()> {
        let Some(watcher) = self.watcher.clone() else {
            ctx.note("macro_reloads", "0");
            return Ok(());
        };
        let outcomes = tokio::task::spawn_blocking(move || watcher.scan())
            .await
            .context("macro rescan task")?;
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        for outcome in outcomes.iter().filter(|o| o.result.is_err()) {
            if let Err(err) = &outcome.result {
                tracing::warn!(name = %outcome.name, error = %err, "macro rescan rejected file");
            }
        }
        ctx.note("macro_reloads", (outcomes.len() - failed).to_string());
        ctx.note("macro_failures", failed.to_string());
        Ok(())
    }

    async fn check(&self, ctx: &mut CycleContext) -> Result<()> {
        let total = note_u64(ctx, "window_total");
        let fallbacks = note_u64(ctx, "window_fallbacks");
        let ratio = if total == 0 {
            0.0
        } else {
            fallbacks as f64 / total as f64
        };
        let verdict = if total > 0 && ratio > self.max_fallback_ratio {
            "degraded"
        } else {
            "healthy"
        };
        ctx.note("fallback_ratio", format!("{ratio:.3}"));
        ctx.note("verdict", verdict);
        metrics::gauge!("cycle.fallback_ratio").set(ratio);
        Ok(())
    }

    async fn act(&self, ctx: &mut CycleContext) -> Result<()> {
        let verdict = ctx.notes.get("verdict").map(String::as_str).unwrap_or("healthy");
        let ratio = ctx.notes.get("fallback_ratio").cloned().unwrap_or_default();
        let reloads = ctx.notes.get("macro_reloads").cloned().unwrap_or_default();
        if verdict == "degraded" {
            tracing::warn!(
                cycle_id = ctx.cycle_id,
                reason = %ctx.reason,
                fallback_ratio = %ratio,
                max = self.max_fallback_ratio,
                "decision quality degraded; tiers are falling through to the fallback action"
            );
        } else {
            tracing::info!(
                cycle_id = ctx.cycle_id,
                reason = %ctx.reason,
                fallback_ratio = %ratio,
                macro_reloads = %reloads,
                "improvement cycle complete"
            );
        }
        Ok(())
    }
}

fn note_u64(ctx: &CycleContext, key: &str) -> u64 {
    ctx.notes
        .get(key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use core_types::DecisionTier;
    use decision_engine::{DecisionConfig, TierStatsSnapshot};
    use macro_registry::{MacroRegistry, MacroRegistryConfig};
    use state_store::GameStateStore;

    use super::*;

    fn snapshot(total: u64, fallbacks: u64) -> DecisionStatsSnapshot {
        let mut tiers = BTreeMap::new();
        tiers.insert(
            DecisionTier::Rule.as_str().to_string(),
            TierStatsSnapshot {
                resolved: total - fallbacks,
                ..TierStatsSnapshot::default()
            },
        );
        DecisionStatsSnapshot {
            total,
            fallbacks,
            avg_fallback_latency_ms: 0.0,
            tiers,
        }
    }

    #[test]
    fn window_is_relative_to_previous_cycle() {
        let now = snapshot(30, 12);
        assert_eq!(window(&now, None), (30, 12));
        assert_eq!(window(&now, Some(&snapshot(10, 2))), (20, 10));
    }

    #[tokio::test]
    async fn full_pass_rescans_macros_and_scores_fallbacks() {
        let locks = LockOrderRegistry::for_build();
        let store = Arc::new(GameStateStore::new(&locks));
        let decisions = Arc::new(DecisionCoordinator::new(DecisionConfig::default(), store, None));
        // No snapshot published: every decision falls back.
        for _ in 0..3 {
            decisions.decide_auto().await;
        }

        let dir = std::env::temp_dir().join(format!("pdca-{}", core_types::new_id()));
        fs::create_dir_all(&dir).expect("mkdir");
        fs::write(dir.join("rest.macro"), "macro rest {\n do sit\n}\n").expect("write");
        let registry = Arc::new(MacroRegistry::new(MacroRegistryConfig::default(), &locks));
        let watcher = Arc::new(MacroDirWatcher::new(&dir, registry.clone(), &locks));

        let cycle = PdcaCycle::new(decisions, Some(watcher), 0.5, &locks);
        let mut ctx = CycleContext {
            cycle_id: 1,
            reason: "test".to_string(),
            ..CycleContext::default()
        };
        cycle.plan(&mut ctx).await.expect("plan");
        cycle.execute(&mut ctx).await.expect("do");
        cycle.check(&mut ctx).await.expect("check");
        cycle.act(&mut ctx).await.expect("act");

        assert_eq!(ctx.notes["window_total"], "3");
        assert_eq!(ctx.notes["macro_reloads"], "1");
        assert_eq!(ctx.notes["verdict"], "degraded");
        assert_eq!(registry.names(), vec!["rest".to_string()]);

        // Nothing new since the last pass.
        let mut next = CycleContext::default();
        cycle.plan(&mut next).await.expect("plan");
        cycle.execute(&mut next).await.expect("do");
        cycle.check(&mut next).await.expect("check");
        assert_eq!(next.notes["window_total"], "0");
        assert_eq!(next.notes["macro_reloads"], "0");
        assert_eq!(next.notes["verdict"], "healthy");

        let _ = fs::remove_dir_all(dir);
    }
}
