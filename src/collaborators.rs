//! Contracts for the external services the engine consumes.
//!
//! Text generation and classification are nondeterministic and live behind
//! these traits. The scheduling logic only sees their typed results, and every
//! call is bounded by a timeout; an expired timeout is a transient failure.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::concern::{Concern, FollowUpCandidate};
use crate::error::{EngineError, Result};
use crate::life::LifeState;

/// One inbound interaction from a subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interaction {
    pub subject_id: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

impl Interaction {
    pub fn new(subject_id: impl Into<String>, text: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            subject_id: subject_id.into(),
            text: text.into(),
            at,
        }
    }
}

/// Why a generation call is being made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationPurpose {
    /// Reply to a user message.
    Reply,
    /// Compose a concern follow-up.
    FollowUp,
    /// Proactive work: scheduled tasks, goal checkpoints, reflections.
    Activity,
}

/// Context handed to the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationContext {
    pub purpose: GenerationPurpose,
    pub subject_id: Option<String>,
    /// User text, task description or follow-up brief.
    pub input: String,
    pub life_state: LifeState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concern: Option<Concern>,
}

/// Resolution classifier verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResolutionVerdict {
    pub resolved: bool,
    /// 0.0–1.0.
    pub confidence: f32,
}

/// Text generation service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    async fn generate(&self, context: &GenerationContext) -> Result<String>;
}

/// Decides whether an interaction deserves a later follow-up.
#[async_trait]
pub trait FollowUpClassifier: Send + Sync {
    /// `None` when no follow-up is needed.
    async fn classify_for_followup(
        &self,
        interaction: &Interaction,
    ) -> Result<Option<FollowUpCandidate>>;
}

/// Decides whether an interaction closes out a tracked concern.
#[async_trait]
pub trait ResolutionClassifier: Send + Sync {
    async fn check_resolution(
        &self,
        interaction: &Interaction,
        concern: &Concern,
    ) -> Result<ResolutionVerdict>;
}

/// Await `fut`, turning an elapsed `timeout` into a transient failure.
pub async fn call_with_timeout<T, F>(timeout: Duration, what: &str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::TransientExternal(format!(
            "{what} timed out after {}ms",
            timeout.as_millis()
        ))),
    }
}
