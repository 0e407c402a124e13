//! Context window strategies applied to the working history before each model call.
//!
//! Strategies only shape what the model sees; the stored conversation is never trimmed.

use crate::message::{Message, Role};

pub trait ContextStrategy: Send + Sync {
    fn context_messages(&self, messages: &[Message]) -> Vec<Message>;

    fn name(&self) -> &str;
}

/// Send the whole history (default).
#[derive(Clone, Default)]
pub struct FullContext;

impl ContextStrategy for FullContext {
    fn context_messages(&self, messages: &[Message]) -> Vec<Message> {
        messages.to_vec()
    }

    fn name(&self) -> &str {
        "full"
    }
}

/// Keep roughly the last `window_size` messages.
///
/// The window is widened backwards until it starts on a user message, so a tool
/// result is never sent without the assistant request that produced it. System
/// messages from before the window are kept.
#[derive(Clone)]
pub struct WindowedContext {
    window_size: usize,
}

impl WindowedContext {
    pub fn new(window_size: usize) -> Self {
        Self {
            window_size: window_size.max(1),
        }
    }
}

impl ContextStrategy for WindowedContext {
    fn context_messages(&self, messages: &[Message]) -> Vec<Message> {
        if messages.len() <= self.window_size {
            return messages.to_vec();
        }

        let mut start = messages.len() - self.window_size;
        while start > 0 && messages[start].role != Role::User {
            start -= 1;
        }

        let mut result: Vec<Message> = messages[..start]
            .iter()
            .filter(|m| m.role == Role::System)
            .cloned()
            .collect();
        result.extend(messages[start..].iter().cloned());
        result
    }

    fn name(&self) -> &str {
        "windowed"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Conversation;
    use crate::message::ToolCall;
    use serde_json::json;

    #[test]
    fn window_never_splits_a_tool_exchange() {
        let messages = vec![
            Message::system("Answer finance questions"),
            Message::user("Quote MSFT"),
            Message::assistant("MSFT is 421.50"),
            Message::user("And its RSI?"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new("c1", "get_stock_technical_indicators", json!({}))],
            ),
            Message::tool_result("c1", "get_stock_technical_indicators", "{\"rsi\":61}"),
            Message::assistant("RSI is 61"),
        ];

        let context = WindowedContext::new(2).context_messages(&messages);

        assert_eq!(context[0].role, Role::System);
        assert_eq!(context[1].content, "And its RSI?");
        assert_eq!(context.len(), 5);
        assert!(Conversation::from_messages(context).is_settled());
    }

    #[test]
    fn short_histories_pass_through() {
        let messages = vec![Message::user("hi")];
        assert_eq!(WindowedContext::new(4).context_messages(&messages).len(), 1);
        assert_eq!(FullContext.context_messages(&messages).len(), 1);
    }
}
