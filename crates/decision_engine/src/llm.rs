use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use core_types::{Action, ActionKind, CycleId, GameStateSnapshot};
use dashmap::DashMap;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::config::LlmConfig;

#[derive(Debug, Clone, Serialize)]
pub struct LlmRequest {
    pub request_id: String,
    pub cycle_id: CycleId,
    pub prompt: String,
    pub context: String,
    pub game_state: GameStateSnapshot,
}

impl LlmRequest {
    pub fn new(cycle_id: CycleId, prompt: &str, game_state: GameStateSnapshot) -> Self {
        Self {
            request_id: format!("llm_{cycle_id}_{}", game_state.tick),
            cycle_id,
            prompt: prompt.to_string(),
            context: "Strategic planning for character progression".to_string(),
            game_state,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct LlmAction {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub confidence: f64,
}

impl LlmAction {
    pub fn to_action(&self) -> Action {
        let kind = match self.kind.to_ascii_lowercase().as_str() {
            "attack" => ActionKind::Attack,
            "skill" => ActionKind::Skill,
            "move" => ActionKind::Move,
            "item" | "use_item" => ActionKind::UseItem,
            "command" => ActionKind::Command,
            "macro" | "run_macro" => ActionKind::RunMacro,
            "sit" => ActionKind::Sit,
            "stand" => ActionKind::Stand,
            _ => ActionKind::None,
        };
        Action {
            kind,
            params: self.parameters.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Default)]
pub struct LlmReply {
    #[serde(default)]
    pub action: Option<LlmAction>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn query(&self, request: LlmRequest) -> Result<LlmReply>;
}

/// Client for the strategy service's `/api/v1/llm/query` endpoint.
pub struct HttpLlmClient {
    http: Client,
    endpoint: String,
}

impl HttpLlmClient {
    pub fn new(cfg: &LlmConfig) -> Result<Self> {
        let http = Client::builder()
            .connect_timeout(Duration::from_millis(cfg.connect_timeout_ms))
            .timeout(Duration::from_millis(cfg.request_timeout_ms))
            .build()
            .context("build llm http client")?;
        Ok(Self {
            http,
            endpoint: format!("{}/api/v1/llm/query", cfg.base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn query(&self, request: LlmRequest) -> Result<LlmReply> {
        let resp = self
            .http
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .context("post llm query")?
            .error_for_status()
            .context("llm service status")?;
        resp.json::<LlmReply>().await.context("parse llm reply")
    }
}

/// Per-cycle delivery slots for LLM replies.
///
/// A reply is accepted only while its cycle is still waiting; anything that
/// arrives after the cycle gave up is dropped and counted.
#[derive(Default)]
pub struct LlmMailbox {
    pending: DashMap<CycleId, oneshot::Sender<Result<LlmReply>>>,
    discarded: AtomicU64,
}

impl LlmMailbox {
    pub fn open(&self, cycle_id: CycleId) -> oneshot::Receiver<Result<LlmReply>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(cycle_id, tx);
        rx
    }

    pub fn close(&self, cycle_id: CycleId) {
        self.pending.remove(&cycle_id);
    }

    /// Returns whether the reply reached a waiting cycle.
    pub fn deliver(&self, cycle_id: CycleId, reply: Result<LlmReply>) -> bool {
        let delivered = match self.pending.remove(&cycle_id) {
            Some((_, tx)) => tx.send(reply).is_ok(),
            None => false,
        };
        if !delivered {
            self.discarded.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("decision.llm_late_discard").increment(1);
            tracing::debug!(cycle_id, "discarding late llm reply");
        }
        delivered
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_json_maps_to_action() {
        let raw = r#"{"action":{"type":"item","reason":"heal up","confidence":0.8,"parameters":{"item":"Red Potion"}}}"#;
        let reply: LlmReply = serde_json::from_str(raw).expect("parse");
        let action = reply.action.expect("action");
        assert_eq!(action.confidence, 0.8);
        let mapped = action.to_action();
        assert_eq!(mapped.kind, ActionKind::UseItem);
        assert_eq!(mapped.params.get("item").map(String::as_str), Some("Red Potion"));

        let empty: LlmReply = serde_json::from_str(r#"{"action":null}"#).expect("parse");
        assert!(empty.action.is_none());
    }

    #[tokio::test]
    async fn late_replies_are_discarded() {
        let mailbox = LlmMailbox::default();
        let rx = mailbox.open(1);
        mailbox.close(1);
        assert!(!mailbox.deliver(1, Ok(LlmReply::default())));
        drop(rx);

        let rx2 = mailbox.open(2);
        assert!(!mailbox.deliver(1, Ok(LlmReply::default())), "stale cycle id");
        assert!(mailbox.deliver(2, Ok(LlmReply::default())));
        assert!(rx2.await.expect("delivered").is_ok());
        assert!(!mailbox.deliver(2, Ok(LlmReply::default())), "at most once");
        assert_eq!(mailbox.discarded(), 3);
        assert_eq!(mailbox.pending(), 0);
    }
}
