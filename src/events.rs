use serde::Serialize;
use tokio::sync::mpsc;

use crate::conversation::Conversation;
use crate::message::{Artifact, ToolCall};

/// Incremental events mirroring the loop's transitions, for streaming callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum TurnEvent {
    ModelDelta {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        delta: String,
    },
    ToolCallStarted {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        call: ToolCall,
    },
    ToolCallResult {
        #[serde(skip_serializing_if = "Option::is_none")]
        agent: Option<String>,
        call_id: String,
        name: String,
        content: String,
        is_error: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        artifact: Option<Artifact>,
    },
    Routed {
        specialist: String,
    },
    TurnComplete {
        thread_id: String,
        conversation: Conversation,
    },
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        apology: Option<String>,
    },
}

impl TurnEvent {
    /// Stable kind label, used as the SSE event name.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::ModelDelta { .. } => "model-delta",
            TurnEvent::ToolCallStarted { .. } => "tool-call-started",
            TurnEvent::ToolCallResult { .. } => "tool-call-result",
            TurnEvent::Routed { .. } => "routed",
            TurnEvent::TurnComplete { .. } => "turn-complete",
            TurnEvent::Error { .. } => "error",
        }
    }
}

pub type EventSender = mpsc::UnboundedSender<TurnEvent>;

/// Emits an event if someone is listening. A closed receiver is not an error:
/// the turn still runs to completion and is checkpointed.
pub(crate) fn emit(events: Option<&EventSender>, event: TurnEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_kebab_case_tag() {
        let event = TurnEvent::Routed {
            specialist: "market_analyst".into(),
        };
        let wire = serde_json::to_value(&event).unwrap();
        assert_eq!(wire["event"], "routed");
        assert_eq!(event.kind(), "routed");
    }
}
