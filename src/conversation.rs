use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCall};

/// Ordered message history of one thread.
///
/// Values are treated as snapshots: every step of a turn produces a new
/// `Conversation` rather than mutating one shared between nodes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Conversation {
    messages: Vec<Message>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn into_messages(self) -> Vec<Message> {
        self.messages
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Message> + '_ {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Copy-on-append: returns a new snapshot with `message` at the end.
    pub fn appended(&self, message: Message) -> Self {
        let mut messages = Vec::with_capacity(self.messages.len() + 1);
        messages.extend(self.messages.iter().cloned());
        messages.push(message);
        Self { messages }
    }

    /// Consuming append, for when the previous snapshot is no longer needed.
    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_messages(mut self, messages: impl IntoIterator<Item = Message>) -> Self {
        self.messages.extend(messages);
        self
    }

    /// Text of the most recent assistant message that carries no tool calls.
    pub fn final_reply(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && m.tool_calls.is_empty())
            .map(|m| m.content.as_str())
    }

    /// Tool-call requests that have no tool result yet, in request order.
    pub fn dangling_calls(&self) -> Vec<&ToolCall> {
        let answered: HashSet<&str> = self
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.as_deref())
            .collect();
        self.messages
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .filter(|call| !answered.contains(call.id.as_str()))
            .collect()
    }

    /// Checks the pairing invariant: every tool result answers exactly one
    /// earlier, still unanswered request, and request ids are unique.
    /// Dangling requests are allowed here; see [`Conversation::ensure_settled`].
    pub fn validate(&self) -> Result<()> {
        // call id -> answered yet
        let mut open: HashMap<&str, bool> = HashMap::new();
        for (index, message) in self.messages.iter().enumerate() {
            for call in &message.tool_calls {
                if message.role != Role::Assistant {
                    return Err(AgentError::UnsettledHistory(format!(
                        "message {index} carries tool calls but is not an assistant message"
                    )));
                }
                if open.insert(call.id.as_str(), false).is_some() {
                    return Err(AgentError::UnsettledHistory(format!(
                        "tool call id `{}` is requested more than once",
                        call.id
                    )));
                }
            }
            if message.role == Role::Tool {
                let id = message.tool_call_id.as_deref().ok_or_else(|| {
                    AgentError::UnsettledHistory(format!(
                        "tool result at position {index} has no call id"
                    ))
                })?;
                match open.get_mut(id) {
                    Some(answered) if !*answered => *answered = true,
                    Some(_) => {
                        return Err(AgentError::UnsettledHistory(format!(
                            "tool call `{id}` is answered more than once"
                        )))
                    }
                    None => {
                        return Err(AgentError::UnsettledHistory(format!(
                            "tool result `{id}` does not answer any earlier request"
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Pairing invariant plus no dangling requests.
    pub fn ensure_settled(&self) -> Result<()> {
        self.validate()?;
        let dangling = self.dangling_calls();
        if dangling.is_empty() {
            Ok(())
        } else {
            let ids: Vec<&str> = dangling.iter().map(|c| c.id.as_str()).collect();
            Err(AgentError::UnsettledHistory(format!(
                "unanswered tool calls: {}",
                ids.join(", ")
            )))
        }
    }

    pub fn is_settled(&self) -> bool {
        self.ensure_settled().is_ok()
    }
}

impl From<Vec<Message>> for Conversation {
    fn from(messages: Vec<Message>) -> Self {
        Self::from_messages(messages)
    }
}
