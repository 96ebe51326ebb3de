use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::model::{ModelClient, ModelDelta, ModelReply, ModelRequest, ProviderError, Turn};
use crate::session::SessionStore;
use crate::tools::{ToolSet, render_outcome};

pub const VISION_UNSUPPORTED_NOTE: &str =
    "[image attached but unsupported by current model; ask the user to describe it]";
pub const EMPTY_ANSWER_FALLBACK: &str =
    "I don't have an answer for that right now. Could you rephrase the question?";

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub model: String,
    pub temperature: f32,
    pub system_prompt: String,
    /// Model to tool round trips allowed per user turn.
    pub max_iterations: u32,
    /// Longest wait for a streamed model call to open or yield its next delta.
    pub stream_idle_timeout: Duration,
}

impl AgentConfig {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            system_prompt: cfg.system_prompt.clone(),
            max_iterations: cfg.max_iterations,
            stream_idle_timeout: Duration::from_secs(cfg.model_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Done,
    /// Iteration budget exhausted before a final answer.
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AgentOutcome {
    pub status: RunStatus,
    pub answer: String,
    /// Turns committed to the session during this invocation.
    pub turns: Vec<Turn>,
    pub round_trips: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("model call failed: {0}")]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Progress reported while a turn runs in streaming mode.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Text(String),
    ToolStarted { name: String },
    ToolFinished { name: String, ok: bool },
    Finished { status: RunStatus, answer: String },
}

enum LoopState {
    AwaitingModel,
    ExecutingTool { name: String, arguments: Value },
    Done(String),
    Failed,
}

/// Drives one user turn through the model and its tools.
#[derive(Clone)]
pub struct Agent {
    model: Arc<dyn ModelClient>,
    tools: Arc<ToolSet>,
    store: Arc<dyn SessionStore>,
    config: Arc<AgentConfig>,
}

impl Agent {
    pub fn new(
        model: Arc<dyn ModelClient>,
        tools: Arc<ToolSet>,
        store: Arc<dyn SessionStore>,
        config: AgentConfig,
    ) -> Self {
        Self {
            model,
            tools,
            store,
            config: Arc::new(config),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    /// Runs the tool loop for `user` on top of the session's history.
    ///
    /// With `events` set the model is consumed as a stream and text fragments
    /// are forwarded as they arrive; otherwise each model call is buffered.
    /// History is committed step by step: the user turn with the first step,
    /// then each tool call with its result, then the final answer. Text the
    /// model streams ahead of a tool call is committed as an assistant turn in
    /// the same step as the call. A cancelled or failed invocation leaves the
    /// step in progress uncommitted.
    pub async fn run_turn(
        &self,
        session_id: &str,
        user: Turn,
        events: Option<&mpsc::Sender<AgentEvent>>,
        cancel: &CancellationToken,
    ) -> Result<AgentOutcome, AgentError> {
        let user = self.prepare_user_turn(user);
        let mut transcript = self.store.load(session_id).await?;
        debug!(
            session_id,
            history_turns = transcript.len(),
            model = %self.config.model,
            "starting agent turn"
        );

        transcript.push(user.clone());
        let mut pending = vec![user];
        let mut committed = Vec::new();
        let mut round_trips = 0;
        let specs = self.tools.specs();
        let mut state = LoopState::AwaitingModel;
        // Set once text streamed ahead of a tool call; the next text opens a new paragraph.
        let mut separate = false;

        let (status, answer) = loop {
            state = match state {
                LoopState::AwaitingModel => {
                    if round_trips >= self.config.max_iterations {
                        LoopState::Failed
                    } else if cancel.is_cancelled() {
                        return Ok(cancelled(session_id, committed, round_trips));
                    } else {
                        let request = ModelRequest {
                            system_prompt: self.config.system_prompt.clone(),
                            turns: transcript.clone(),
                            tools: specs.clone(),
                            temperature: self.config.temperature,
                        };
                        let reply = match events {
                            Some(events) => {
                                self.stream_model(&request, events, cancel, &mut separate)
                                    .await?
                            }
                            None => self
                                .call_model(&request, cancel)
                                .await?
                                .map(|reply| (reply, String::new())),
                        };
                        match reply {
                            None => return Ok(cancelled(session_id, committed, round_trips)),
                            Some((ModelReply::Text(text), _)) => LoopState::Done(text),
                            Some((
                                ModelReply::ToolCall {
                                    name,
                                    arguments,
                                    signature,
                                },
                                preamble,
                            )) => {
                                let preamble = preamble.trim();
                                if !preamble.is_empty() {
                                    let said = Turn::assistant(preamble);
                                    transcript.push(said.clone());
                                    pending.push(said);
                                    separate = true;
                                }
                                let call = Turn::ToolCall {
                                    name: name.clone(),
                                    arguments: arguments.clone(),
                                    signature,
                                };
                                transcript.push(call.clone());
                                pending.push(call);
                                LoopState::ExecutingTool { name, arguments }
                            }
                        }
                    }
                }
                LoopState::ExecutingTool { name, arguments } => {
                    if cancel.is_cancelled() {
                        return Ok(cancelled(session_id, committed, round_trips));
                    }
                    emit(events, cancel, AgentEvent::ToolStarted { name: name.clone() }).await;
                    let outcome = self.tools.execute(&name, &arguments).await;
                    if let Err(err) = &outcome {
                        warn!(session_id, tool_name = %name, error = %err, "tool execution failed");
                    }
                    emit(
                        events,
                        cancel,
                        AgentEvent::ToolFinished {
                            name: name.clone(),
                            ok: outcome.is_ok(),
                        },
                    )
                    .await;

                    let result = Turn::tool_result(name, render_outcome(&outcome));
                    transcript.push(result.clone());
                    pending.push(result);
                    self.commit(session_id, &mut pending, &mut committed).await?;
                    round_trips += 1;
                    LoopState::AwaitingModel
                }
                LoopState::Done(text) => {
                    if text.trim().is_empty() {
                        warn!(session_id, "model returned an empty answer");
                        emit_text(events, cancel, &mut separate, EMPTY_ANSWER_FALLBACK).await;
                        break (RunStatus::Done, EMPTY_ANSWER_FALLBACK.to_string());
                    }
                    break (RunStatus::Done, text);
                }
                LoopState::Failed => {
                    warn!(
                        session_id,
                        max_iterations = self.config.max_iterations,
                        "iteration budget exhausted"
                    );
                    let answer = budget_exhausted_message(self.config.max_iterations);
                    emit_text(events, cancel, &mut separate, &answer).await;
                    break (RunStatus::Failed, answer);
                }
            };
        };

        pending.push(Turn::assistant(answer.clone()));
        self.commit(session_id, &mut pending, &mut committed).await?;
        emit(
            events,
            cancel,
            AgentEvent::Finished {
                status,
                answer: answer.clone(),
            },
        )
        .await;
        info!(session_id, ?status, round_trips, "agent turn finished");

        Ok(AgentOutcome {
            status,
            answer,
            turns: committed,
            round_trips,
        })
    }

    fn prepare_user_turn(&self, turn: Turn) -> Turn {
        match turn {
            Turn::User {
                text,
                image: Some(image),
            } if !self.model.supports_vision() => {
                info!(
                    model = %self.model.name(),
                    image = %image.describe(),
                    "dropping image for text-only model"
                );
                let text = text.trim();
                if text.is_empty() {
                    Turn::user(VISION_UNSUPPORTED_NOTE)
                } else {
                    Turn::user(format!("{text}\n\n{VISION_UNSUPPORTED_NOTE}"))
                }
            }
            other => other,
        }
    }

    async fn call_model(
        &self,
        request: &ModelRequest,
        cancel: &CancellationToken,
    ) -> Result<Option<ModelReply>, AgentError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(None),
            reply = self.model.chat(request) => Ok(Some(reply?)),
        }
    }

    /// Streams one model call, forwarding text as it arrives.
    ///
    /// Returns the reply together with the text streamed ahead of a tool
    /// call, or `None` when the turn was cancelled.
    async fn stream_model(
        &self,
        request: &ModelRequest,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
        separate: &mut bool,
    ) -> Result<Option<(ModelReply, String)>, AgentError> {
        let idle = self.config.stream_idle_timeout;
        let mut stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(None),
            opened = tokio::time::timeout(idle, self.model.chat_stream(request)) => match opened {
                Ok(stream) => stream?,
                Err(_) => return Err(stream_stalled(idle).into()),
            },
        };

        let mut text = String::new();
        loop {
            let delta = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(None),
                next = tokio::time::timeout(idle, stream.next()) => match next {
                    Ok(delta) => delta,
                    Err(_) => {
                        warn!(model = %self.model.name(), idle_secs = idle.as_secs(), "model stream stalled");
                        return Err(stream_stalled(idle).into());
                    }
                },
            };
            match delta {
                None => break,
                Some(Err(err)) => return Err(err.into()),
                Some(Ok(ModelDelta::ToolCall {
                    name,
                    arguments,
                    signature,
                })) => {
                    let reply = ModelReply::ToolCall {
                        name,
                        arguments,
                        signature,
                    };
                    return Ok(Some((reply, text)));
                }
                Some(Ok(ModelDelta::Text(fragment))) => {
                    if fragment.is_empty() {
                        continue;
                    }
                    if !send_text(events, separate, &fragment).await {
                        debug!("event receiver dropped; cancelling turn");
                        cancel.cancel();
                        return Ok(None);
                    }
                    text.push_str(&fragment);
                }
            }
        }
        Ok(Some((ModelReply::Text(text), String::new())))
    }

    async fn commit(
        &self,
        session_id: &str,
        pending: &mut Vec<Turn>,
        committed: &mut Vec<Turn>,
    ) -> Result<(), AgentError> {
        let step = std::mem::take(pending);
        debug!(
            session_id,
            roles = ?step.iter().map(Turn::role).collect::<Vec<_>>(),
            "committing step"
        );
        self.store.append(session_id, step.clone()).await?;
        committed.extend(step);
        Ok(())
    }
}

fn cancelled(session_id: &str, committed: Vec<Turn>, round_trips: u32) -> AgentOutcome {
    info!(session_id, round_trips, "agent turn cancelled");
    AgentOutcome {
        status: RunStatus::Cancelled,
        answer: String::new(),
        turns: committed,
        round_trips,
    }
}

async fn emit(events: Option<&mpsc::Sender<AgentEvent>>, cancel: &CancellationToken, event: AgentEvent) {
    if let Some(events) = events
        && events.send(event).await.is_err()
    {
        cancel.cancel();
    }
}

/// Forwards a text fragment; `false` once the receiver is gone.
async fn send_text(events: &mpsc::Sender<AgentEvent>, separate: &mut bool, fragment: &str) -> bool {
    let text = if std::mem::take(separate) {
        format!("\n\n{fragment}")
    } else {
        fragment.to_string()
    };
    events.send(AgentEvent::Text(text)).await.is_ok()
}

async fn emit_text(
    events: Option<&mpsc::Sender<AgentEvent>>,
    cancel: &CancellationToken,
    separate: &mut bool,
    fragment: &str,
) {
    if let Some(events) = events
        && !send_text(events, separate, fragment).await
    {
        cancel.cancel();
    }
}

fn stream_stalled(idle: Duration) -> ProviderError {
    ProviderError::Timeout(format!(
        "Model stream produced no output for {}s. \
         Increase MODEL_TIMEOUT_SECS or check model responsiveness.",
        idle.as_secs()
    ))
}

fn budget_exhausted_message(max_iterations: u32) -> String {
    format!(
        "Sorry, I was unable to complete within iteration budget ({max_iterations} tool round trips). \
         Please try a more specific question."
    )
}
