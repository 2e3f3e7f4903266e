//! Answer Runner — turns `ask.created` events into recorded Answers.
//!
//! Per ask: verify the context hash (fail fast, no LLM call on mismatch),
//! resolve the role, short-circuit through the decision cache, build the
//! layered prompt, call the LLM under the ask's timeout, parse and
//! shape-check the output with bounded retries, attest, and record the
//! answer through the Job Manager. The runner never takes the server down;
//! every failure becomes an ERROR answer.

pub mod parse;
pub mod prompt;
pub mod role;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::domain::envelope::policy_version;
use crate::domain::{
    decision_key, now_ms, stable_hash_context, AnswerPayload, AnswerStatus, Ask, Attestation,
    DecisionCacheEntry,
};
use crate::events::RelayEvent;
use crate::llm::{CompletionRequest, LlmProvider};
use crate::manager::JobManager;
use crate::store::Storage;

use parse::{parse_response, validate_output_shape, ParsedAnswer};
use prompt::{build_prompt, prompt_fingerprint};
pub use role::{RoleDefinition, RoleLibrary};

/// A produced answer plus the cache write it earned.
struct ProducedAnswer {
    payload: AnswerPayload,
    cache_key: Option<String>,
}

/// LLM-backed responder for executor asks.
pub struct AnswerRunner {
    manager: Arc<JobManager>,
    llm: Arc<dyn LlmProvider>,
    roles: Arc<RoleLibrary>,
    config: RunnerConfig,
}

impl AnswerRunner {
    pub fn new(
        manager: Arc<JobManager>,
        llm: Arc<dyn LlmProvider>,
        roles: Arc<RoleLibrary>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            manager,
            llm,
            roles,
            config,
        }
    }

    /// Subscribe to the bus and answer asks until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut rx = self.manager.bus().subscribe();
            info!("Answer runner started");
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Ok(RelayEvent::AskCreated { ask }) => {
                            let runner = Arc::clone(&self);
                            tokio::spawn(async move {
                                runner.handle_ask(ask).await;
                            });
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Runner lagged behind the bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            info!("Answer runner stopped");
        })
    }

    /// Answer one ask end to end. Errors are recorded, never propagated.
    pub async fn handle_ask(&self, ask: Ask) {
        let produced = self.produce_answer(&ask).await;

        let cacheable = produced.payload.cacheable.unwrap_or(true)
            && produced.payload.status == AnswerStatus::Answered;
        let answer_json = produced.payload.answer_json.clone();
        let answer_text = produced.payload.answer_text.clone();
        let policy_trace = produced.payload.policy_trace.clone();

        match self.manager.record_answer(produced.payload).await {
            Ok(answer) => {
                debug!(ask_id = %answer.ask_id, status = answer.status.as_str(), "Runner answered");
            }
            Err(e) => {
                warn!(ask_id = %ask.ask_id, error = %e, "Runner failed to record answer");
                return;
            }
        }

        if let Some(key) = produced.cache_key {
            if cacheable {
                let entry = DecisionCacheEntry {
                    decision_key: key,
                    answer_json,
                    answer_text,
                    policy_trace,
                    created_at: now_ms(),
                    ttl_seconds: self.config.cache_ttl_seconds,
                };
                if let Err(e) = self.manager.store().decision_cache_upsert(&entry).await {
                    warn!(ask_id = %ask.ask_id, error = %e, "Decision cache write failed");
                }
            }
        }
    }

    async fn produce_answer(&self, ask: &Ask) -> ProducedAnswer {
        // 1. Fail fast on tampered context; no LLM call.
        let computed = stable_hash_context(&ask.context_envelope);
        if computed != ask.context_hash {
            return ProducedAnswer {
                payload: self.error_payload(
                    ask,
                    format!(
                        "E_CONTEXT_MISMATCH: computed {computed}, declared {}",
                        ask.context_hash
                    ),
                ),
                cache_key: None,
            };
        }

        // 2. Resolve the role; an explicit unknown id is an error.
        let role = match self.roles.resolve(ask.role_id.as_deref(), ask.ask_type) {
            Ok(role) => role,
            Err(e) => {
                return ProducedAnswer {
                    payload: self.error_payload(ask, e.to_string()),
                    cache_key: None,
                }
            }
        };

        let policy = policy_version(&ask.context_envelope).unwrap_or("");
        let key = decision_key(ask.ask_type.as_str(), &ask.prompt, &ask.context_hash, policy);

        let constraints = ask.constraints.clone().unwrap_or_default();
        let max_tokens = constraints
            .max_tokens
            .or(role.limits.max_tokens)
            .unwrap_or(self.config.default_max_tokens);
        let timeout_s = constraints
            .timeout_s
            .or(role.limits.timeout_s)
            .unwrap_or(self.config.default_timeout.as_secs());

        let prompt = build_prompt(ask, role, max_tokens, timeout_s);
        let fingerprint = prompt_fingerprint(&prompt);
        let attestation = Attestation {
            context_hash: ask.context_hash.clone(),
            role_id: role.id.clone(),
            role_version: role.version.clone(),
            model: self.llm.model_name().to_string(),
            prompt_fingerprint: fingerprint,
            tools_used: Vec::new(),
            policy_version: policy_version(&ask.context_envelope).map(String::from),
        };

        // 3. Cached decision wins without an LLM call.
        match self.manager.store().decision_cache_get(&key).await {
            Ok(Some(entry)) if !entry.is_expired(now_ms()) => {
                debug!(ask_id = %ask.ask_id, "Decision cache hit");
                return ProducedAnswer {
                    payload: AnswerPayload {
                        kind: "Answer".into(),
                        ask_id: ask.ask_id.clone(),
                        job_id: ask.job_id.clone(),
                        step_id: ask.step_id.clone(),
                        status: AnswerStatus::Answered,
                        answer_text: entry.answer_text,
                        answer_json: entry.answer_json,
                        attestation: Some(attestation),
                        artifacts: None,
                        policy_trace: entry.policy_trace,
                        cacheable: Some(true),
                        ask_back: None,
                        error: None,
                    },
                    cache_key: None,
                };
            }
            Ok(_) => {}
            Err(e) => warn!(ask_id = %ask.ask_id, error = %e, "Decision cache read failed"),
        }

        // 4–6. Call, parse, shape-check, retry with exponential backoff.
        let output_schema = role.output_schema.clone();
        let mut cacheable = true;
        let mut parsed: Option<ParsedAnswer> = None;
        for attempt in 0..=self.config.max_retries {
            let request = CompletionRequest {
                prompt: prompt.clone(),
                max_tokens,
                timeout: Duration::from_secs(timeout_s),
            };
            match self.llm.complete(request).await {
                Ok(response) => {
                    let candidate = parse_response(&response.text);
                    let shape_ok = candidate
                        .answer_json
                        .as_ref()
                        .map(|json| validate_output_shape(json, output_schema.as_ref()))
                        .unwrap_or(true);
                    if shape_ok {
                        parsed = Some(candidate);
                        break;
                    }
                    if attempt == self.config.max_retries {
                        // Downgrade: hand the raw JSON back as text.
                        let raw = candidate
                            .answer_json
                            .map(|v| v.to_string())
                            .unwrap_or_default();
                        parsed = Some(ParsedAnswer {
                            answer_text: Some(raw),
                            answer_json: None,
                            ask_back: candidate.ask_back,
                        });
                        cacheable = false;
                        break;
                    }
                    debug!(ask_id = %ask.ask_id, attempt, "Output shape invalid; retrying");
                }
                Err(e) => {
                    if attempt == self.config.max_retries {
                        return ProducedAnswer {
                            payload: self.error_payload(ask, format!("LLM call failed: {e}")),
                            cache_key: None,
                        };
                    }
                    warn!(ask_id = %ask.ask_id, attempt, error = %e, "LLM call failed; retrying");
                }
            }
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }

        let parsed = parsed.unwrap_or_default();
        ProducedAnswer {
            payload: AnswerPayload {
                kind: "Answer".into(),
                ask_id: ask.ask_id.clone(),
                job_id: ask.job_id.clone(),
                step_id: ask.step_id.clone(),
                status: AnswerStatus::Answered,
                answer_text: parsed.answer_text,
                answer_json: parsed.answer_json,
                attestation: Some(attestation),
                artifacts: None,
                policy_trace: None,
                cacheable: Some(cacheable),
                ask_back: parsed.ask_back,
                error: None,
            },
            cache_key: cacheable.then_some(key),
        }
    }

    fn error_payload(&self, ask: &Ask, message: String) -> AnswerPayload {
        AnswerPayload {
            kind: "Answer".into(),
            ask_id: ask.ask_id.clone(),
            job_id: ask.job_id.clone(),
            step_id: ask.step_id.clone(),
            status: AnswerStatus::Error,
            answer_text: None,
            answer_json: None,
            attestation: None,
            artifacts: None,
            policy_trace: None,
            cacheable: Some(false),
            ask_back: None,
            error: Some(message),
        }
    }
}
