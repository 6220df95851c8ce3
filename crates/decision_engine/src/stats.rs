use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use core_types::DecisionTier;
use serde::Serialize;

#[derive(Debug, Default)]
struct TierCounters {
    resolved: AtomicU64,
    declined: AtomicU64,
    low_confidence: AtomicU64,
    timeouts: AtomicU64,
    latency_us: AtomicU64,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct TierStatsSnapshot {
    pub resolved: u64,
    pub declined: u64,
    pub low_confidence: u64,
    pub timeouts: u64,
    /// Mean end-to-end latency of cycles this tier resolved.
    pub avg_latency_ms: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DecisionStatsSnapshot {
    pub total: u64,
    pub fallbacks: u64,
    pub avg_fallback_latency_ms: f64,
    pub tiers: BTreeMap<String, TierStatsSnapshot>,
}

impl DecisionStatsSnapshot {
    pub fn fallback_ratio(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.fallbacks as f64 / self.total as f64
        }
    }

    pub fn resolved_by(&self, tier: DecisionTier) -> u64 {
        self.tiers.get(tier.as_str()).map(|t| t.resolved).unwrap_or(0)
    }
}

fn avg_ms(total_us: u64, n: u64) -> f64 {
    if n == 0 {
        0.0
    } else {
        total_us as f64 / n as f64 / 1_000.0
    }
}

#[derive(Debug, Default)]
pub struct DecisionStats {
    tiers: [TierCounters; 4],
    total: AtomicU64,
    fallbacks: AtomicU64,
    fallback_latency_us: AtomicU64,
}

impl DecisionStats {
    fn tier(&self, tier: DecisionTier) -> &TierCounters {
        let idx = match tier {
            DecisionTier::Reflex => 0,
            DecisionTier::Rule => 1,
            DecisionTier::Ml => 2,
            DecisionTier::Llm => 3,
        };
        &self.tiers[idx]
    }

    pub fn record_resolved(&self, tier: DecisionTier, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        let t = self.tier(tier);
        t.resolved.fetch_add(1, Ordering::Relaxed);
        t.latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_fallback(&self, latency: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.fallback_latency_us
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_declined(&self, tier: DecisionTier) {
        self.tier(tier).declined.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_low_confidence(&self, tier: DecisionTier) {
        self.tier(tier).low_confidence.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self, tier: DecisionTier) {
        self.tier(tier).timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DecisionStatsSnapshot {
        let tiers = DecisionTier::ALL
            .iter()
            .map(|&tier| {
                let t = self.tier(tier);
                let resolved = t.resolved.load(Ordering::Relaxed);
                (
                    tier.as_str().to_string(),
                    TierStatsSnapshot {
                        resolved,
                        declined: t.declined.load(Ordering::Relaxed),
                        low_confidence: t.low_confidence.load(Ordering::Relaxed),
                        timeouts: t.timeouts.load(Ordering::Relaxed),
                        avg_latency_ms: avg_ms(t.latency_us.load(Ordering::Relaxed), resolved),
                    },
                )
            })
            .collect();
        let fallbacks = self.fallbacks.load(Ordering::Relaxed);
        DecisionStatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            fallbacks,
            avg_fallback_latency_ms: avg_ms(self.fallback_latency_us.load(Ordering::Relaxed), fallbacks),
            tiers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_aggregates_per_tier() {
        let stats = DecisionStats::default();
        stats.record_resolved(DecisionTier::Reflex, Duration::from_millis(2));
        stats.record_resolved(DecisionTier::Reflex, Duration::from_millis(4));
        stats.record_declined(DecisionTier::Rule);
        stats.record_fallback(Duration::from_millis(100));

        let snap = stats.snapshot();
        assert_eq!(snap.total, 3);
        assert_eq!(snap.resolved_by(DecisionTier::Reflex), 2);
        assert!((snap.tiers["reflex"].avg_latency_ms - 3.0).abs() < 1e-9);
        assert_eq!(snap.tiers["rule"].declined, 1);
        assert!((snap.fallback_ratio() - 1.0 / 3.0).abs() < 1e-9);
    }
}
