use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use crate::budget::{Category, CostClass, Priority};
use crate::bus::events;
use crate::clock::{Clock, PhaseSchedule, ScheduleTz};
use crate::registry::{
    CognitiveNode, ExecutionContext, ExecutorError, NodeExecutor, NodeResult, RetryPolicy, Trigger,
};
use crate::state::{GlobalState, RhythmPatch, ScalarField, StateDelta};

// ============================================================
// Closure executor
// ============================================================

type ExecFn =
    dyn Fn(ExecutionContext) -> BoxFuture<'static, Result<NodeResult, ExecutorError>> + Send + Sync;

/// Wraps an async closure as an executor. The workhorse for small system
/// nodes and for tests.
pub struct FnExecutor {
    f: Box<ExecFn>,
}

impl FnExecutor {
    pub fn new<F, Fut>(f: F) -> Arc<dyn NodeExecutor>
    where
        F: Fn(ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<NodeResult, ExecutorError>> + Send + 'static,
    {
        Arc::new(Self { f: Box::new(move |ctx| Box::pin(f(ctx))) })
    }

    pub fn noop() -> Arc<dyn NodeExecutor> {
        Self::new(|_| async { Ok(NodeResult::default()) })
    }
}

#[async_trait]
impl NodeExecutor for FnExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, ExecutorError> {
        (self.f)(ctx).await
    }
}

// ============================================================
// LLM client (Ollama-style chat endpoint)
// ============================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct LlmReply {
    pub content: String,
    pub tokens_used: u64,
}

/// Non-streaming inference client for background cognition. Streaming chat
/// lives with the transport, outside the kernel.
pub struct LlmClient {
    host: String,
    model: String,
    client: reqwest::Client,
    usd_per_1k_tokens: f64,
}

impl LlmClient {
    pub fn new(host: String, model: String, usd_per_1k_tokens: f64) -> Self {
        Self {
            host,
            model,
            client: reqwest::Client::builder()
                .timeout(StdDuration::from_secs(300))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            usd_per_1k_tokens,
        }
    }

    pub fn cost_of(&self, tokens: u64) -> f64 {
        tokens as f64 / 1000.0 * self.usd_per_1k_tokens
    }

    pub async fn infer(&self, messages: Vec<LlmMessage>) -> Result<LlmReply, ExecutorError> {
        let request = serde_json::json!({
            "model": self.model.as_str(),
            "messages": messages,
            "stream": false,
        });

        let response = self
            .client
            .post(format!("{}/api/chat", self.host))
            .json(&request)
            .send()
            .await
            .map_err(|e| ExecutorError::transient(format!("llm request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let err = ExecutorError {
                message: format!("llm returned {status}: {body}"),
                transient: status.is_server_error() || status.as_u16() == 429,
                dollars_used: 0.0,
            };
            return Err(err);
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::transient(format!("llm response unreadable: {e}")))?;
        let content = json["message"]["content"].as_str().unwrap_or_default().to_string();
        let tokens_used = json["prompt_eval_count"].as_u64().unwrap_or(0)
            + json["eval_count"].as_u64().unwrap_or_else(|| (content.len() / 4) as u64);

        Ok(LlmReply { content, tokens_used })
    }

    /// System + single user message, the shape every background node uses.
    pub fn build_messages(system_prompt: &str, user_prompt: &str) -> Vec<LlmMessage> {
        vec![
            LlmMessage { role: "system".to_string(), content: system_prompt.to_string() },
            LlmMessage { role: "user".to_string(), content: user_prompt.to_string() },
        ]
    }
}

// ============================================================
// Prompt builders
// ============================================================

pub fn reflection_prompt(state: &GlobalState) -> String {
    format!(
        "It is the end of a {} day (phase: {}). Engagement ran at {:.2}, \
         contentment at {:.2}, concern at {:.2}. Active threads: {}. \
         Write a thoughtful reflection on the day in markdown, 2-3 paragraphs.",
        state.rhythm_day_summary,
        state.rhythm_phase,
        state.engagement,
        state.contentment,
        state.concern,
        if state.active_threads.is_empty() { "none".to_string() } else { state.active_threads.join(", ") },
    )
}

pub fn dream_prompt(state: &GlobalState) -> String {
    format!(
        "Drift into a dream. Current contentment {:.2}, concern {:.2}. \
         Open questions on the mind: {}. Hallucinate a creative, abstract \
         connection between them. Make it poetic and introspective, 1-2 paragraphs.",
        state.contentment,
        state.concern,
        if state.active_questions.is_empty() { "none in particular".to_string() } else { state.active_questions.join("; ") },
    )
}

pub fn research_prompt(state: &GlobalState) -> String {
    format!(
        "Pick the most compelling of these open questions and research it from \
         what you already know, laying out what is established and what remains \
         uncertain: {}.",
        if state.active_questions.is_empty() { "anything that sparks curiosity".to_string() } else { state.active_questions.join("; ") },
    )
}

pub fn summarize_prompt(state: &GlobalState) -> String {
    format!(
        "Condense the recent stream of work (threads: {}) into a short summary \
         suitable for long-term memory. Plain prose, under 150 words.",
        if state.active_threads.is_empty() { "none".to_string() } else { state.active_threads.join(", ") },
    )
}

// ============================================================
// LLM-backed node executor
// ============================================================

type PromptFn = dyn Fn(&GlobalState) -> String + Send + Sync;

/// Thin adapter that turns one prompt template into a cognitive node body:
/// build the prompt from the snapshot, run inference, report cost, nudge
/// state on success.
pub struct LlmNodeExecutor {
    client: Arc<LlmClient>,
    system_prompt: String,
    build_prompt: Box<PromptFn>,
    success_nudges: Vec<(ScalarField, f32)>,
    chain_to: Vec<String>,
    output_key: &'static str,
}

impl LlmNodeExecutor {
    pub fn new(
        client: Arc<LlmClient>,
        system_prompt: impl Into<String>,
        build_prompt: impl Fn(&GlobalState) -> String + Send + Sync + 'static,
        output_key: &'static str,
    ) -> Self {
        Self {
            client,
            system_prompt: system_prompt.into(),
            build_prompt: Box::new(build_prompt),
            success_nudges: Vec::new(),
            chain_to: Vec::new(),
            output_key,
        }
    }

    pub fn nudge(mut self, field: ScalarField, add: f32) -> Self {
        self.success_nudges.push((field, add));
        self
    }

    pub fn chain(mut self, node_id: impl Into<String>) -> Self {
        self.chain_to.push(node_id.into());
        self
    }
}

#[async_trait]
impl NodeExecutor for LlmNodeExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, ExecutorError> {
        let prompt = (self.build_prompt)(&ctx.snapshot);
        let messages = LlmClient::build_messages(&self.system_prompt, &prompt);

        let reply = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                return Err(ExecutorError::transient("cancelled before inference completed"));
            }
            reply = self.client.infer(messages) => reply?,
        };

        let mut delta = StateDelta::new(ctx.node_id.clone(), chrono::Utc::now())
            .reason(format!("{} completed", ctx.node_id));
        for (field, add) in &self.success_nudges {
            delta = delta.nudge(*field, *add);
        }

        let mut output = serde_json::Map::new();
        output.insert(self.output_key.to_string(), serde_json::Value::String(reply.content));

        Ok(NodeResult {
            output: serde_json::Value::Object(output),
            state_delta: if delta.is_noop() { None } else { Some(delta) },
            chain_to: self.chain_to.clone(),
            request_nodes: Vec::new(),
            tokens_used: reply.tokens_used,
            dollars_used: self.client.cost_of(reply.tokens_used),
        })
    }
}

// ============================================================
// Rhythm node
// ============================================================

/// Free node fired at phase boundaries: writes the current phase, bumps
/// `day_epoch` past midnight, and announces `phase.changed`.
pub struct RhythmExecutor {
    clock: Arc<dyn Clock>,
    phases: PhaseSchedule,
}

impl RhythmExecutor {
    pub fn new(clock: Arc<dyn Clock>, phases: PhaseSchedule) -> Self {
        Self { clock, phases }
    }
}

#[async_trait]
impl NodeExecutor for RhythmExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> Result<NodeResult, ExecutorError> {
        let local = self.clock.now().with_timezone(&self.clock.local_offset());
        let phase = self.phases.phase_at(local.time());
        let day_epoch = self.clock.day_epoch();

        let output = serde_json::json!({
            "phase": phase.as_str(),
            "day_epoch": day_epoch,
        });

        if ctx.snapshot.rhythm_phase == phase.as_str() && ctx.snapshot.day_epoch == day_epoch {
            return Ok(NodeResult::with_output(output));
        }

        let delta = StateDelta::new(ctx.node_id.clone(), self.clock.now())
            .rhythm(RhythmPatch {
                phase: Some(phase.as_str().to_string()),
                day_summary: None,
                day_epoch: Some(day_epoch),
            })
            .emit(events::PHASE_CHANGED, serde_json::json!({ "phase": phase.as_str() }));

        Ok(NodeResult { output, state_delta: Some(delta), ..Default::default() })
    }
}

// ============================================================
// Built-in node set
// ============================================================

/// The system nodes every deployment starts with. Collaborators register
/// their own on top at startup.
pub fn builtin_nodes(
    client: Arc<LlmClient>,
    clock: Arc<dyn Clock>,
    phases: PhaseSchedule,
    reflection_hour: u32,
) -> Vec<CognitiveNode> {
    let persona = "You are a reflective, curious mind keeping its own counsel.";

    vec![
        CognitiveNode::new(
            "rhythm.phase_check",
            Category::System,
            CostClass::Free,
            Arc::new(RhythmExecutor::new(clock, phases)),
        )
        .priority(Priority::High)
        .trigger(Trigger::Schedule { spec: "0 6,12,17,21 * * *".to_string(), tz: ScheduleTz::Local })
        .trigger(Trigger::Schedule { spec: "0 0 * * *".to_string(), tz: ScheduleTz::Local }),

        CognitiveNode::new(
            "journal.daily_reflection",
            Category::Journal,
            CostClass::Session,
            Arc::new(
                LlmNodeExecutor::new(client.clone(), persona, reflection_prompt, "reflection")
                    .nudge(ScalarField::Contentment, 0.05)
                    .nudge(ScalarField::CognitiveLoad, -0.10),
            ),
        )
        .session()
        .trigger(Trigger::Schedule {
            spec: format!("0 {reflection_hour} * * *"),
            tz: ScheduleTz::Local,
        }),

        CognitiveNode::new(
            "dream.nightly",
            Category::Dream,
            CostClass::Dream,
            Arc::new(
                LlmNodeExecutor::new(client.clone(), persona, dream_prompt, "dream")
                    .nudge(ScalarField::Contentment, 0.10)
                    .nudge(ScalarField::Concern, -0.10),
            ),
        )
        .session()
        .priority(Priority::Low)
        .trigger(Trigger::StateThreshold {
            expr: "engagement < 0.2 && energy_available > 0.3".to_string(),
            debounce: StdDuration::from_secs(6 * 3600),
        }),

        CognitiveNode::new(
            "research.wiki_page",
            Category::Research,
            CostClass::Research,
            Arc::new(
                LlmNodeExecutor::new(client.clone(), persona, research_prompt, "findings")
                    .nudge(ScalarField::Curiosity, 0.05)
                    .chain("memory.summarize_conversation"),
            ),
        )
        .session()
        .trigger(Trigger::Manual)
        .retry_policy(RetryPolicy::default()),

        CognitiveNode::new(
            "memory.summarize_conversation",
            Category::Memory,
            CostClass::Light,
            Arc::new(LlmNodeExecutor::new(client, persona, summarize_prompt, "summary")),
        )
        .trigger(Trigger::Chain { after: vec!["research.wiki_page".to_string()] }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::ReservationToken;
    use crate::clock::ManualClock;
    use chrono::{DateTime, Utc};
    use pretty_assertions::assert_eq;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    fn ctx(snapshot: GlobalState) -> ExecutionContext {
        ExecutionContext {
            node_id: "test.node".to_string(),
            execution_id: Uuid::new_v4(),
            snapshot: Arc::new(snapshot),
            cancel: CancellationToken::new(),
            reservation: ReservationToken {
                id: Uuid::new_v4(),
                node_id: "test.node".to_string(),
                category: Category::System,
                amount: 0.0,
                from_reserve: 0.0,
                day_epoch: 0,
            },
        }
    }

    fn state() -> GlobalState {
        GlobalState::initial(Utc::now(), 20_000)
    }

    #[tokio::test]
    async fn fn_executor_passes_result_through() {
        let exec = FnExecutor::new(|_| async {
            Ok(NodeResult::with_output(serde_json::json!({"ok": true})))
        });
        let result = exec.execute(ctx(state())).await.unwrap();
        assert_eq!(result.output["ok"], true);
    }

    #[tokio::test]
    async fn cancelled_llm_node_reports_transient_error() {
        let client = Arc::new(LlmClient::new(
            "http://127.0.0.1:1".to_string(),
            "test-model".to_string(),
            0.002,
        ));
        let exec = LlmNodeExecutor::new(client, "persona", dream_prompt, "dream");
        let ctx = ctx(state());
        ctx.cancel.cancel();
        let err = exec.execute(ctx).await.unwrap_err();
        assert!(err.transient);
    }

    #[tokio::test]
    async fn rhythm_node_writes_phase_and_epoch() {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::utc(
            DateTime::parse_from_rfc3339("2026-03-01T06:00:00Z").unwrap().with_timezone(&Utc),
        ));
        let exec = RhythmExecutor::new(clock.clone(), PhaseSchedule::default());

        let mut snapshot = state();
        snapshot.rhythm_phase = "night".to_string();
        snapshot.day_epoch = 0;

        let result = exec.execute(ctx(snapshot)).await.unwrap();
        let delta = result.state_delta.unwrap();
        let rhythm = delta.rhythm.unwrap();
        assert_eq!(rhythm.phase.as_deref(), Some("morning"));
        assert_eq!(rhythm.day_epoch, Some(clock.day_epoch()));
        assert_eq!(delta.emit.unwrap().name, events::PHASE_CHANGED);
    }

    #[tokio::test]
    async fn rhythm_node_is_quiet_when_nothing_changed() {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::utc(
            DateTime::parse_from_rfc3339("2026-03-01T06:30:00Z").unwrap().with_timezone(&Utc),
        ));
        let exec = RhythmExecutor::new(clock.clone(), PhaseSchedule::default());

        let mut snapshot = state();
        snapshot.rhythm_phase = "morning".to_string();
        snapshot.day_epoch = clock.day_epoch();

        let result = exec.execute(ctx(snapshot)).await.unwrap();
        assert!(result.state_delta.is_none());
    }

    #[test]
    fn prompts_reflect_snapshot() {
        let mut s = state();
        s.active_questions = vec!["why do rivers meander".to_string()];
        s.rhythm_phase = "evening".to_string();
        assert!(dream_prompt(&s).contains("rivers"));
        assert!(reflection_prompt(&s).contains("evening"));
        assert!(research_prompt(&s).contains("rivers"));
    }

    #[test]
    fn token_cost_is_linear() {
        let client = LlmClient::new("http://localhost:11434".into(), "m".into(), 0.002);
        assert!((client.cost_of(1500) - 0.003).abs() < 1e-9);
    }

    #[test]
    fn builtin_set_is_registrable() {
        let clock: Arc<ManualClock> = Arc::new(ManualClock::utc(Utc::now()));
        let client = Arc::new(LlmClient::new("http://localhost:11434".into(), "m".into(), 0.002));
        let nodes = builtin_nodes(client, clock, PhaseSchedule::default(), 23);
        let registry = crate::registry::NodeRegistry::new();
        for node in nodes {
            registry.register(node).unwrap();
        }
        assert_eq!(registry.list().len(), 5);
    }
}
