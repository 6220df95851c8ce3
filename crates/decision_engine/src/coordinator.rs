use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use core_types::{
    Action, CoreError, CycleId, Decision, DecisionTier, GameStateSnapshot, ModelVersion,
    StateVersion,
};
use infra_clock::Deadline;
use model_slot::{ModelLease, ModelSlot};
use serde::Serialize;
use state_store::{GameStateStore, StateView};
use tokio::task::JoinHandle;

use crate::config::DecisionConfig;
use crate::llm::{LlmClient, LlmMailbox, LlmRequest};
use crate::ml::ModelTier;
use crate::reflex::ReflexTier;
use crate::rules::RuleTier;
use crate::stats::{DecisionStats, DecisionStatsSnapshot};
use crate::tier::{Tier, TierContext, TierOutcome};

/// Position of one cycle in the escalation ladder. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionPhase {
    Idle,
    Reflex,
    Rule,
    Ml,
    Llm,
    Resolved,
}

impl From<DecisionTier> for DecisionPhase {
    fn from(tier: DecisionTier) -> Self {
        match tier {
            DecisionTier::Reflex => Self::Reflex,
            DecisionTier::Rule => Self::Rule,
            DecisionTier::Ml => Self::Ml,
            DecisionTier::Llm => Self::Llm,
        }
    }
}

impl DecisionPhase {
    /// Returns false, leaving the phase unchanged, if `next` is not ahead of the current phase.
    pub fn advance(&mut self, next: DecisionPhase) -> bool {
        if next <= *self {
            return false;
        }
        *self = next;
        true
    }
}

/// Closes the cycle's mailbox slot and aborts the query however the wait ends,
/// including when the caller drops the cycle mid-flight.
struct PendingLlm {
    mailbox: Arc<LlmMailbox>,
    cycle_id: CycleId,
    task: JoinHandle<()>,
}

impl Drop for PendingLlm {
    fn drop(&mut self) {
        self.mailbox.close(self.cycle_id);
        self.task.abort();
    }
}

struct Verdict {
    tier: Option<DecisionTier>,
    action: Action,
    confidence: f64,
    reasoning: String,
}

pub struct DecisionCoordinator {
    cfg: DecisionConfig,
    store: Arc<GameStateStore>,
    models: Option<Arc<ModelSlot>>,
    tiers: Vec<Arc<dyn Tier>>,
    llm: Option<Arc<dyn LlmClient>>,
    mailbox: Arc<LlmMailbox>,
    stats: DecisionStats,
    next_cycle: AtomicU64,
    origin: Instant,
    // Milliseconds since `origin` plus one; zero means never queried.
    last_llm_ms: AtomicU64,
}

impl DecisionCoordinator {
    /// Default tier stack: reflex, rules, then the policy model in `models`.
    pub fn new(
        cfg: DecisionConfig,
        store: Arc<GameStateStore>,
        models: Option<Arc<ModelSlot>>,
    ) -> Self {
        Self {
            cfg,
            store,
            models,
            tiers: vec![
                Arc::new(ReflexTier::default()),
                Arc::new(RuleTier::default()),
                Arc::new(ModelTier),
            ],
            llm: None,
            mailbox: Arc::new(LlmMailbox::default()),
            stats: DecisionStats::default(),
            next_cycle: AtomicU64::new(0),
            origin: Instant::now(),
            last_llm_ms: AtomicU64::new(0),
        }
    }

    pub fn with_tiers(mut self, mut tiers: Vec<Arc<dyn Tier>>) -> Self {
        tiers.sort_by_key(|t| t.kind());
        self.tiers = tiers;
        self
    }

    pub fn with_llm(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(client);
        self
    }

    pub fn cfg(&self) -> &DecisionConfig {
        &self.cfg
    }

    pub fn stats(&self) -> DecisionStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn mailbox(&self) -> &LlmMailbox {
        &self.mailbox
    }

    /// Decides against the routine or emergency deadline, picked from the current snapshot.
    pub async fn decide_auto(&self) -> Decision {
        let started = Instant::now();
        let view = self.store.read_consistent();
        let budget = match &view {
            Some(v) => self.cfg.deadline_for(&v.snapshot),
            None => Duration::from_millis(self.cfg.routine_deadline_ms),
        };
        self.run_cycle(view, Deadline::starting_at(started, budget))
            .await
    }

    pub async fn decide(&self, deadline: Deadline) -> Decision {
        let view = self.store.read_consistent();
        self.run_cycle(view, deadline).await
    }

    async fn run_cycle(&self, view: Option<StateView>, deadline: Deadline) -> Decision {
        let cycle_id = self.next_cycle.fetch_add(1, Ordering::Relaxed) + 1;
        let Some(view) = view else {
            return self.fallback(cycle_id, StateVersion::ZERO, None, &deadline, "no state published yet");
        };
        let mut phase = DecisionPhase::Idle;
        let mut lease: Option<ModelLease> = None;
        let mut model_version: Option<ModelVersion> = None;

        for tier in &self.tiers {
            let kind = tier.kind();
            if !phase.advance(kind.into()) {
                tracing::warn!(cycle_id, tier = %kind, "duplicate tier skipped");
                continue;
            }
            if deadline.is_expired() {
                break;
            }
            let slice = deadline.slice(self.cfg.slices.for_tier(kind));
            let pin = match (&self.models, kind == DecisionTier::Ml && lease.is_none()) {
                (Some(models), true) => {
                    let wait = slice.min(Duration::from_millis(self.cfg.model_lease_wait_ms));
                    Some((models.clone(), wait))
                }
                _ => None,
            };
            let Some((outcome, returned)) = self
                .run_tier(tier, cycle_id, &view, lease.take(), pin, slice)
                .await
            else {
                continue;
            };
            lease = returned;
            model_version = model_version.or(lease.as_ref().map(ModelLease::version));
            if let Some(verdict) = self.judge(cycle_id, kind, outcome) {
                phase.advance(DecisionPhase::Resolved);
                return self.resolve(cycle_id, view.version, model_version, &deadline, verdict);
            }
        }
        drop(lease);

        let state: &GameStateSnapshot = &view.snapshot;

        if let Some(client) = &self.llm {
            if !deadline.is_expired() && phase.advance(DecisionPhase::Llm) {
                if self.claim_llm_slot() {
                    match self.consult_llm(client, cycle_id, state, &deadline).await {
                        Ok(outcome) => {
                            if let Some(verdict) = self.judge(cycle_id, DecisionTier::Llm, outcome) {
                                return self.resolve(cycle_id, view.version, model_version, &deadline, verdict);
                            }
                        }
                        Err(CoreError::TierTimeout { slice_ms, .. }) => {
                            self.tier_timed_out(cycle_id, DecisionTier::Llm, Duration::from_millis(slice_ms));
                        }
                        Err(err) => tracing::warn!(cycle_id, error = %err, "llm tier failed"),
                    }
                } else {
                    tracing::trace!(cycle_id, "llm tier rate limited");
                }
            }
        }

        tracing::debug!(cycle_id, error = %CoreError::AllTiersExhausted, "returning fallback action");
        self.fallback(cycle_id, view.version, model_version, &deadline, "all tiers exhausted")
    }

    /// Runs one tier on the blocking pool and waits at most `slice` for it.
    ///
    /// `pin` asks the task to lease a model first. The lease travels with the task and comes
    /// back with the outcome; an overrunning task keeps it until the tier returns.
    async fn run_tier(
        &self,
        tier: &Arc<dyn Tier>,
        cycle_id: CycleId,
        view: &StateView,
        lease: Option<ModelLease>,
        pin: Option<(Arc<ModelSlot>, Duration)>,
        slice: Duration,
    ) -> Option<(TierOutcome, Option<ModelLease>)> {
        let kind = tier.kind();
        let tier = tier.clone();
        let state = view.snapshot.clone();
        let state_version = view.version;
        let task = tokio::task::spawn_blocking(move || {
            let lease = lease.or_else(|| pin.and_then(|(models, wait)| models.lease_within(wait)));
            let ctx = TierContext {
                cycle_id,
                state: state.as_ref(),
                state_version,
                model: lease.as_ref(),
                slice,
            };
            let outcome = tier.evaluate(&ctx);
            (outcome, lease)
        });

        match tokio::time::timeout(slice, task).await {
            Ok(Ok(done)) => Some(done),
            Ok(Err(err)) => {
                self.stats.record_declined(kind);
                tracing::warn!(cycle_id, tier = %kind, error = %err, "tier task failed");
                None
            }
            Err(_) => {
                self.tier_timed_out(cycle_id, kind, slice);
                None
            }
        }
    }

    fn judge(&self, cycle_id: CycleId, tier: DecisionTier, outcome: TierOutcome) -> Option<Verdict> {
        let threshold = self.cfg.thresholds.for_tier(tier);
        match outcome {
            TierOutcome::Decided {
                action,
                confidence,
                reasoning,
            } if unit_confidence(confidence) >= threshold => Some(Verdict {
                tier: Some(tier),
                action,
                confidence: unit_confidence(confidence),
                reasoning,
            }),
            TierOutcome::Decided { confidence, .. } => {
                self.stats.record_low_confidence(tier);
                tracing::trace!(cycle_id, %tier, confidence, threshold, "tier not confident enough");
                None
            }
            TierOutcome::Declined(reason) => {
                self.stats.record_declined(tier);
                tracing::trace!(cycle_id, %tier, %reason, "tier declined");
                None
            }
        }
    }

    fn tier_timed_out(&self, cycle_id: CycleId, tier: DecisionTier, slice: Duration) {
        let err = CoreError::TierTimeout {
            tier,
            slice_ms: slice.as_millis() as u64,
        };
        self.stats.record_timeout(tier);
        metrics::counter!("decision.tier_timeout", "tier" => tier.as_str()).increment(1);
        tracing::debug!(cycle_id, error = %err, "escalating past tier");
    }

    /// One LLM query per `min_llm_interval_ms`, shared by all concurrent cycles.
    fn claim_llm_slot(&self) -> bool {
        let now = self.origin.elapsed().as_millis() as u64 + 1;
        let last = self.last_llm_ms.load(Ordering::Acquire);
        if last != 0 && now.saturating_sub(last) < self.cfg.min_llm_interval_ms {
            return false;
        }
        self.last_llm_ms
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn consult_llm(
        &self,
        client: &Arc<dyn LlmClient>,
        cycle_id: CycleId,
        state: &GameStateSnapshot,
        deadline: &Deadline,
    ) -> Result<TierOutcome, CoreError> {
        let slice = deadline.slice(self.cfg.slices.for_tier(DecisionTier::Llm));
        let rx = self.mailbox.open(cycle_id);
        let request = LlmRequest::new(cycle_id, &self.cfg.llm_prompt, state.clone());
        let client = client.clone();
        let mailbox = self.mailbox.clone();
        let _pending = PendingLlm {
            mailbox: self.mailbox.clone(),
            cycle_id,
            task: tokio::spawn(async move {
                let reply = client.query(request).await;
                mailbox.deliver(cycle_id, reply);
            }),
        };

        match tokio::time::timeout(slice, rx).await {
            Ok(Ok(Ok(reply))) => Ok(match reply.action {
                Some(a) => TierOutcome::decided(a.to_action(), a.confidence, format!("llm: {}", a.reason)),
                None => TierOutcome::declined("llm returned no action"),
            }),
            Ok(Ok(Err(err))) => Ok(TierOutcome::declined(format!("llm query failed: {err:#}"))),
            Ok(Err(_)) => Ok(TierOutcome::declined("llm task ended without a reply")),
            Err(_) => Err(CoreError::TierTimeout {
                    tier: DecisionTier::Llm,
                slice_ms: slice.as_millis() as u64,
            }),
        }
    }

    fn resolve(
        &self,
        cycle_id: CycleId,
        state_version: StateVersion,
        model_version: Option<ModelVersion>,
        deadline: &Deadline,
        verdict: Verdict,
    ) -> Decision {
        let elapsed = deadline.elapsed();
        let latency_ms = elapsed.as_secs_f64() * 1_000.0;
        if let Some(tier) = verdict.tier {
            self.stats.record_resolved(tier, elapsed);
            metrics::counter!("decision.resolved", "tier" => tier.as_str()).increment(1);
        }
        metrics::histogram!("decision.latency_ms").record(latency_ms);
        tracing::debug!(
            cycle_id,
            tier = verdict.tier.map(DecisionTier::as_str).unwrap_or("fallback"),
            action = %verdict.action.kind,
            confidence = verdict.confidence,
            latency_ms,
            "decision"
        );
        Decision {
            cycle_id,
            action: verdict.action,
            tier: verdict.tier,
            confidence: verdict.confidence,
            latency_ms,
            reasoning: verdict.reasoning,
            state_version,
            model_version,
        }
    }

    fn fallback(
        &self,
        cycle_id: CycleId,
        state_version: StateVersion,
        model_version: Option<ModelVersion>,
        deadline: &Deadline,
        reason: &str,
    ) -> Decision {
        self.stats.record_fallback(deadline.elapsed());
        metrics::counter!("decision.fallback").increment(1);
        self.resolve(
            cycle_id,
            state_version,
            model_version,
            deadline,
            Verdict {
                tier: None,
                action: self.cfg.fallback_action.clone(),
                confidence: 0.0,
                reasoning: format!("fallback: {reason}"),
            },
        )
    }
}

/// Non-finite confidences count as zero; everything else is clamped into [0, 1].
fn unit_confidence(confidence: f64) -> f64 {
    if confidence.is_finite() {
        confidence.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::Result;
    use async_trait::async_trait;
    use core_types::{ActionKind, CharacterStats};
    use lock_order::LockOrderRegistry;
    use model_slot::{JsonModelLoader, LinearPolicyModel, ModelSlotConfig, PolicyClass};

    use super::*;
    use crate::llm::{LlmAction, LlmReply};

    struct FixedTier {
        kind: DecisionTier,
        outcome: TierOutcome,
        delay: Duration,
        calls: Arc<AtomicUsize>,
    }

    impl FixedTier {
        fn boxed(kind: DecisionTier, outcome: TierOutcome) -> (Arc<dyn Tier>, Arc<AtomicUsize>) {
            Self::slow(kind, outcome, Duration::ZERO)
        }

        fn slow(
            kind: DecisionTier,
            outcome: TierOutcome,
            delay: Duration,
        ) -> (Arc<dyn Tier>, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let tier = Arc::new(Self {
                kind,
                outcome,
                delay,
                calls: calls.clone(),
            });
            (tier, calls)
        }
    }

    impl Tier for FixedTier {
        fn kind(&self) -> DecisionTier {
            self.kind
        }

        fn evaluate(&self, _ctx: &TierContext<'_>) -> TierOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            self.outcome.clone()
        }
    }

    struct ScriptedLlm {
        delay: Duration,
        confidence: f64,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmClient for ScriptedLlm {
        async fn query(&self, request: LlmRequest) -> Result<LlmReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(LlmReply {
                action: Some(LlmAction {
                    kind: "macro".to_string(),
                    parameters: [("name".to_string(), format!("plan-{}", request.cycle_id))]
                        .into_iter()
                        .collect(),
                    reason: "level milestone".to_string(),
                    confidence: self.confidence,
                }),
            })
        }
    }

    fn sure(confidence: f64) -> TierOutcome {
        TierOutcome::decided(Action::new(ActionKind::Attack), confidence, "test")
    }

    fn store_with_state() -> Arc<GameStateStore> {
        let store = Arc::new(GameStateStore::new(&LockOrderRegistry::for_build()));
        store
            .publish(GameStateSnapshot {
                stats: CharacterStats {
                    hp: 100,
                    max_hp: 100,
                    sp: 100,
                    max_sp: 100,
                    weight: 10,
                    max_weight: 100,
                    ..CharacterStats::default()
                },
                tick: 1,
                ..GameStateSnapshot::default()
            })
            .expect("publish");
        store
    }

    fn cfg() -> DecisionConfig {
        DecisionConfig {
            fallback_action: Action::new(ActionKind::Sit),
            min_llm_interval_ms: 0,
            ..DecisionConfig::default()
        }
    }

    #[tokio::test]
    async fn confident_reflex_short_circuits_everything_else() {
        let (reflex, reflex_calls) = FixedTier::boxed(DecisionTier::Reflex, sure(0.95));
        let (rule, rule_calls) = FixedTier::boxed(DecisionTier::Rule, sure(0.99));
        let (ml, ml_calls) = FixedTier::boxed(DecisionTier::Ml, sure(0.99));
        let llm = Arc::new(ScriptedLlm {
            delay: Duration::ZERO,
            confidence: 0.99,
            calls: AtomicUsize::new(0),
        });
        let c = DecisionCoordinator::new(cfg(), store_with_state(), None)
            .with_tiers(vec![ml, rule, reflex])
            .with_llm(llm.clone());

        let d = c.decide(Deadline::new(Duration::from_millis(100))).await;
        assert_eq!(d.tier, Some(DecisionTier::Reflex));
        assert_eq!(d.state_version, StateVersion(1));
        assert_eq!(reflex_calls.load(Ordering::SeqCst), 1);
        assert_eq!(rule_calls.load(Ordering::SeqCst), 0);
        assert_eq!(ml_calls.load(Ordering::SeqCst), 0);
        assert_eq!(llm.calls.load(Ordering::SeqCst), 0);
        assert_eq!(c.stats().resolved_by(DecisionTier::Reflex), 1);
    }

    #[tokio::test]
    async fn confidence_equal_to_threshold_resolves_at_cheaper_tier() {
        let (reflex, _) = FixedTier::boxed(DecisionTier::Reflex, sure(0.9));
        let (rule, rule_calls) = FixedTier::boxed(DecisionTier::Rule, sure(1.0));
        let c = DecisionCoordinator::new(cfg(), store_with_state(), None).with_tiers(vec![reflex, rule]);
        let d = c.decide(Deadline::new(Duration::from_millis(100))).await;
        assert_eq!(d.tier, Some(DecisionTier::Reflex));
        assert_eq!(rule_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn all_tiers_declining_returns_fallback_within_deadline() {
        let tiers = [DecisionTier::Reflex, DecisionTier::Rule, DecisionTier::Ml]
            .into_iter()
            .map(|k| FixedTier::boxed(k, TierOutcome::declined("nothing to do")).0)
            .collect();
        let llm = Arc::new(ScriptedLlm {
            delay: Duration::from_secs(2),
            confidence: 0.99,
            calls: AtomicUsize::new(0),
        });
        let c = DecisionCoordinator::new(cfg(), store_with_state(), None)
            .with_tiers(tiers)
            .with_llm(llm.clone());

        let budget = Duration::from_millis(50);
        let started = Instant::now();
        let d = c.decide(Deadline::new(budget)).await;
        let took = started.elapsed();

        assert!(d.is_fallback());
        assert_eq!(d.action.kind, ActionKind::Sit);
        assert!(took <= budget + Duration::from_millis(30), "took {took:?}");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.mailbox().pending(), 0, "timed-out cycle no longer accepts replies");
        let stats = c.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.tiers["llm"].timeouts, 1);
    }

    #[tokio::test]
    async fn overrunning_tier_escalates() {
        let (reflex, _) = FixedTier::slow(DecisionTier::Reflex, sure(1.0), Duration::from_millis(20));
        let (rule, rule_calls) = FixedTier::boxed(DecisionTier::Rule, sure(0.8));
        let c = DecisionCoordinator::new(cfg(), store_with_state(), None).with_tiers(vec![reflex, rule]);
        let d = c.decide(Deadline::new(Duration::from_millis(100))).await;
        assert_eq!(d.tier, Some(DecisionTier::Rule));
        assert_eq!(rule_calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.stats().tiers["reflex"].timeouts, 1);
    }

    #[tokio::test]
    async fn blocking_tier_cannot_hold_the_cycle_past_its_deadline() {
        let (reflex, _) = FixedTier::slow(
            DecisionTier::Reflex,
            TierOutcome::declined("thinking"),
            Duration::from_millis(200),
        );
        let c = DecisionCoordinator::new(cfg(), store_with_state(), None).with_tiers(vec![reflex]);

        let budget = Duration::from_millis(50);
        let started = Instant::now();
        let d = c.decide(Deadline::new(budget)).await;
        let took = started.elapsed();

        assert!(d.is_fallback());
        assert!(took <= budget + Duration::from_millis(30), "took {took:?}");
        assert_eq!(c.stats().tiers["reflex"].timeouts, 1);
    }

    #[tokio::test]
    async fn llm_confidence_is_kept_within_unit_range() {
        let cases = [(7.5, Some(DecisionTier::Llm), 1.0), (f64::NAN, None, 0.0)];
        for (reported, tier, expected) in cases {
            let llm = Arc::new(ScriptedLlm {
                delay: Duration::ZERO,
                confidence: reported,
                calls: AtomicUsize::new(0),
            });
            let c = DecisionCoordinator::new(cfg(), store_with_state(), None)
                .with_tiers(Vec::new())
                .with_llm(llm);
            let d = c.decide(Deadline::new(Duration::from_millis(100))).await;
            assert_eq!(d.tier, tier, "reported {reported}");
            assert_eq!(d.confidence, expected, "reported {reported}");
        }
    }

    #[tokio::test]
    async fn abandoned_cycle_releases_its_llm_slot() {
        let llm = Arc::new(ScriptedLlm {
            delay: Duration::from_secs(3_600),
            confidence: 0.99,
            calls: AtomicUsize::new(0),
        });
        let c = DecisionCoordinator::new(cfg(), store_with_state(), None)
            .with_tiers(Vec::new())
            .with_llm(llm.clone());

        let cut_short = tokio::time::timeout(
            Duration::from_millis(10),
            c.decide(Deadline::new(Duration::from_millis(500))),
        )
        .await;
        assert!(cut_short.is_err(), "caller gave up before the llm answered");
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.mailbox().pending(), 0);
    }

    #[tokio::test]
    async fn llm_resolves_then_is_rate_limited() {
        let (reflex, _) = FixedTier::boxed(DecisionTier::Reflex, sure(0.1));
        let llm = Arc::new(ScriptedLlm {
            delay: Duration::from_millis(5),
            confidence: 0.8,
            calls: AtomicUsize::new(0),
        });
        let c = DecisionCoordinator::new(
            DecisionConfig {
                min_llm_interval_ms: 60_000,
                ..cfg()
            },
            store_with_state(),
            None,
        )
        .with_tiers(vec![reflex])
        .with_llm(llm.clone());

        let first = c.decide(Deadline::new(Duration::from_millis(100))).await;
        assert_eq!(first.tier, Some(DecisionTier::Llm));
        assert_eq!(first.action.kind, ActionKind::RunMacro);
        assert_eq!(
            first.action.params.get("name").map(String::as_str),
            Some(format!("plan-{}", first.cycle_id).as_str())
        );

        let second = c.decide(Deadline::new(Duration::from_millis(100))).await;
        assert!(second.is_fallback());
        assert_eq!(llm.calls.load(Ordering::SeqCst), 1);
        assert_eq!(c.stats().tiers["reflex"].low_confidence, 2);
    }

    #[tokio::test]
    async fn empty_store_yields_fallback() {
        let store = Arc::new(GameStateStore::new(&LockOrderRegistry::for_build()));
        let c = DecisionCoordinator::new(cfg(), store, None);
        let d = c.decide_auto().await;
        assert!(d.is_fallback());
        assert_eq!(d.state_version, StateVersion::ZERO);
    }

    #[tokio::test]
    async fn calm_state_falls_through_to_policy_model() {
        let registry = LockOrderRegistry::for_build();
        let model = LinearPolicyModel {
            name: "farm-v1".to_string(),
            classes: vec![PolicyClass {
                action: Action::new(ActionKind::Attack),
                weights: vec![0.0; model_slot::features::FEATURE_DIM],
                bias: 0.0,
            }],
        };
        let slot = Arc::new(ModelSlot::new(
            Arc::new(model),
            Arc::new(JsonModelLoader),
            ModelSlotConfig::default(),
            &registry,
        ));
        let c = DecisionCoordinator::new(cfg(), store_with_state(), Some(slot.clone()));

        let d = c.decide_auto().await;
        assert_eq!(d.tier, Some(DecisionTier::Ml));
        assert_eq!(d.model_version, Some(1));
        assert_eq!(d.action.kind, ActionKind::Attack);
        assert_eq!(slot.metrics().inflight, 0, "lease released after the cycle");
    }

    #[test]
    fn phase_only_moves_forward() {
        let mut phase = DecisionPhase::Idle;
        assert!(phase.advance(DecisionPhase::Rule));
        assert!(!phase.advance(DecisionPhase::Reflex));
        assert!(!phase.advance(DecisionPhase::Rule));
        assert_eq!(phase, DecisionPhase::Rule);
        assert!(phase.advance(DecisionPhase::Resolved));
    }
}
