use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::agent::{Agent, AgentEvent, RunStatus};
use crate::model::{ImageRef, Turn};
use crate::session::SessionLocks;

pub const DEGRADED_REPLY: &str = "⚠️ The AI engine is temporarily unavailable. Please try again shortly.";

const STREAM_BUFFER: usize = 32;

/// One inbound user message.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub text: String,
    /// Base64 data URI or http(s) URL.
    #[serde(default)]
    pub image: Option<String>,
}

impl ChatRequest {
    pub fn new(session_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            text: text.into(),
            image: None,
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    fn into_turn(self) -> Result<(String, Turn), RequestError> {
        let session_id = self.session_id.trim();
        if session_id.is_empty() {
            return Err(RequestError::MissingSession);
        }

        let image = match self.image.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(ImageRef::parse(raw).ok_or(RequestError::InvalidImage)?),
        };
        let text = self.text.trim();

        let turn = match image {
            Some(image) => Turn::user_with_image(text, image),
            None if text.is_empty() => return Err(RequestError::EmptyTurn),
            None => Turn::user(text),
        };
        Ok((session_id.to_string(), turn))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("session_id must not be empty")]
    MissingSession,
    #[error("message must contain text or an image")]
    EmptyTurn,
    #[error("image must be a base64 data:image URI or an http(s) URL")]
    InvalidImage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    Answered,
    /// The iteration budget ran out before a final answer.
    Incomplete,
    /// The model provider failed; the reply is the generic fallback.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatReply {
    pub session_id: String,
    pub reply: String,
    pub status: ReplyStatus,
}

/// Validates requests, serializes turns per session and runs the agent.
#[derive(Clone)]
pub struct ChatService {
    agent: Agent,
    locks: Arc<SessionLocks>,
}

impl ChatService {
    pub fn new(agent: Agent) -> Self {
        Self {
            agent,
            locks: Arc::new(SessionLocks::new()),
        }
    }

    /// Runs one turn and returns the whole answer.
    pub async fn reply(&self, request: ChatRequest) -> Result<ChatReply, RequestError> {
        let (session_id, turn) = request.into_turn()?;
        let _turn_guard = self.locks.acquire(&session_id).await;

        let (reply, status) = match self
            .agent
            .run_turn(&session_id, turn, None, &CancellationToken::new())
            .await
        {
            Ok(outcome) => match outcome.status {
                RunStatus::Done => (outcome.answer, ReplyStatus::Answered),
                RunStatus::Failed => (outcome.answer, ReplyStatus::Incomplete),
                RunStatus::Cancelled => (DEGRADED_REPLY.to_string(), ReplyStatus::Degraded),
            },
            Err(err) => {
                error!(
                    session_id = %session_id,
                    model = %self.agent.model_name(),
                    error = %err,
                    "agent turn failed"
                );
                (DEGRADED_REPLY.to_string(), ReplyStatus::Degraded)
            }
        };

        Ok(ChatReply {
            session_id,
            reply,
            status,
        })
    }

    /// Runs one turn and yields the answer as it is produced.
    ///
    /// Nothing starts until the stream is first polled. The stream always
    /// yields at least one chunk, and dropping it cancels the turn.
    pub fn reply_stream(&self, request: ChatRequest) -> Result<BoxStream<'static, String>, RequestError> {
        let (session_id, turn) = request.into_turn()?;
        let agent = self.agent.clone();
        let locks = Arc::clone(&self.locks);

        Ok(async_stream::stream! {
            let cancel = CancellationToken::new();
            let _cancel_on_drop = cancel.clone().drop_guard();
            let (tx, mut rx) = mpsc::channel(STREAM_BUFFER);

            let task = tokio::spawn({
                let session_id = session_id.clone();
                async move {
                    let _turn_guard = locks.acquire(&session_id).await;
                    agent.run_turn(&session_id, turn, Some(&tx), &cancel).await
                }
            });

            let mut emitted = false;
            while let Some(event) = rx.recv().await {
                if let AgentEvent::Text(fragment) = event {
                    emitted = true;
                    yield fragment;
                }
            }

            match task.await {
                Ok(Ok(outcome)) => {
                    if !emitted {
                        warn!(session_id = %session_id, status = ?outcome.status, "turn produced no text");
                        yield DEGRADED_REPLY.to_string();
                    }
                }
                Ok(Err(err)) => {
                    error!(session_id = %session_id, error = %err, "streamed agent turn failed");
                    yield DEGRADED_REPLY.to_string();
                }
                Err(err) => {
                    error!(session_id = %session_id, error = %err, "streamed agent task aborted");
                    yield DEGRADED_REPLY.to_string();
                }
            }
        }
        .boxed())
    }
}
