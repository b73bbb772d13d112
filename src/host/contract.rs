//! Versioned command/event envelopes for the stdio host.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::scheduler::EngineOutput;

/// Contract version for host command/event envelopes.
pub const EVENT_VERSION: u32 = 1;

/// Commands a host process may send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandName {
    #[serde(rename = "engine.user_message")]
    UserMessage,
    #[serde(rename = "engine.scheduled_task")]
    ScheduledTask,
    #[serde(rename = "engine.goal_checkpoint")]
    GoalCheckpoint,
    #[serde(rename = "engine.snapshot")]
    Snapshot,
    #[serde(rename = "engine.stop")]
    Stop,
}

impl CommandName {
    /// Render command name to wire format.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UserMessage => "engine.user_message",
            Self::ScheduledTask => "engine.scheduled_task",
            Self::GoalCheckpoint => "engine.goal_checkpoint",
            Self::Snapshot => "engine.snapshot",
            Self::Stop => "engine.stop",
        }
    }
}

/// `engine.user_message` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserMessagePayload {
    pub subject_id: String,
    pub text: String,
}

/// `engine.scheduled_task` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTaskPayload {
    pub task: String,
}

/// `engine.goal_checkpoint` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoalCheckpointPayload {
    pub goal: String,
}

/// A versioned command envelope from host -> engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    pub v: u32,
    pub request_id: String,
    pub command: CommandName,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(
        request_id: impl Into<String>,
        command: CommandName,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            command,
            payload,
        }
    }

    /// Validate envelope version and required identifiers.
    pub fn validate(&self) -> Result<(), String> {
        if self.v != EVENT_VERSION {
            return Err(format!(
                "unsupported contract version {}; expected {}",
                self.v, EVENT_VERSION
            ));
        }
        if self.request_id.trim().is_empty() {
            return Err("request_id cannot be empty".to_owned());
        }
        Ok(())
    }
}

/// A versioned response envelope from engine -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub v: u32,
    pub request_id: String,
    pub ok: bool,
    pub payload: serde_json::Value,
    pub error: Option<String>,
}

impl ResponseEnvelope {
    #[must_use]
    pub fn ok(request_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: true,
            payload,
            error: None,
        }
    }

    #[must_use]
    pub fn error(request_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            v: EVENT_VERSION,
            request_id: request_id.into(),
            ok: false,
            payload: serde_json::Value::Null,
            error: Some(message.into()),
        }
    }
}

/// A versioned, unsolicited event from engine -> host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub v: u32,
    pub event_id: String,
    pub event: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    #[must_use]
    pub fn new(event: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            v: EVENT_VERSION,
            event_id: Uuid::new_v4().to_string(),
            event: event.into(),
            payload,
        }
    }

    /// Wrap an engine output. The event name is the output's `type` tag.
    pub fn from_output(output: &EngineOutput) -> serde_json::Result<Self> {
        let payload = serde_json::to_value(output)?;
        let name = payload
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("output");
        Ok(Self::new(format!("engine.{name}"), payload))
    }
}
