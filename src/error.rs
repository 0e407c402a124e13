use std::time::Duration;

use thiserror::Error;

use crate::conversation::Conversation;

pub type Result<T> = std::result::Result<T, AgentError>;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool `{0}` not found")]
    ToolNotFound(String),

    #[error("tool `{name}` invocation failed: {source}")]
    ToolInvocation {
        name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("invalid arguments for tool `{name}`: {reason}")]
    InvalidToolArguments { name: String, reason: String },

    #[error("tool `{name}` timed out after {elapsed:?}")]
    ToolTimeout { name: String, elapsed: Duration },

    /// Missing credential or endpoint. Aborts the whole turn.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("language model error: {0}")]
    LanguageModel(String),

    /// Transient provider failure (rate limit, 5xx, transport). Retried by the model client.
    #[error("language model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("language model timed out after {0:?}")]
    ModelTimeout(Duration),

    #[error("model contract violation: {0}")]
    ModelContractViolation(String),

    /// The transcript is kept for diagnostics only and is never checkpointed.
    #[error("turn exceeded {rounds} rounds without a final answer")]
    LoopBoundExceeded {
        rounds: usize,
        transcript: Box<Conversation>,
    },

    #[error("turn exceeded its deadline of {0:?}")]
    TurnDeadlineExceeded(Duration),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("conversation is not settled: {0}")]
    UnsettledHistory(String),

    #[error("thread `{0}` already has a turn in flight")]
    ThreadBusy(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error(transparent)]
    Serde(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Whether the model client should retry the request that produced this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::ModelUnavailable(_) | AgentError::ModelTimeout(_)
        )
    }

    /// Errors that abort a turn even when raised by a single tool call.
    pub fn is_fatal(&self) -> bool {
        match self {
            AgentError::Configuration(_) => true,
            AgentError::ToolInvocation { source, .. } => source
                .downcast_ref::<AgentError>()
                .map(AgentError::is_fatal)
                .unwrap_or(false),
            _ => false,
        }
    }

    /// Assistant-style text shown to the user in place of a reply, for failures the
    /// user can reasonably be told about. Operator-side failures return `None` and
    /// surface as request errors instead.
    pub fn apology(&self) -> Option<String> {
        match self {
            AgentError::ToolNotFound(_)
            | AgentError::ToolInvocation { .. }
            | AgentError::InvalidToolArguments { .. }
            | AgentError::ToolTimeout { .. } => Some(
                "I'm sorry, one of the data sources I rely on failed while answering. Please try again."
                    .into(),
            ),
            AgentError::ModelContractViolation(_)
            | AgentError::LanguageModel(_)
            | AgentError::ModelUnavailable(_)
            | AgentError::ModelTimeout(_) => Some(
                "I'm sorry, I ran into a problem while working on your request. Please try again."
                    .into(),
            ),
            _ => None,
        }
    }

    pub(crate) fn tool(name: impl Into<String>, source: AgentError) -> Self {
        AgentError::ToolInvocation {
            name: name.into(),
            source: Box::new(source),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configuration_is_fatal_even_when_wrapped() {
        let wrapped = AgentError::tool(
            "get_weather",
            AgentError::Configuration("missing OPENWEATHER_API_KEY".into()),
        );
        assert!(wrapped.is_fatal());
        assert!(wrapped.apology().is_some());

        let plain = AgentError::tool("get_weather", AgentError::Storage("boom".into()));
        assert!(!plain.is_fatal());
    }

    #[test]
    fn operator_errors_have_no_apology() {
        assert!(AgentError::Configuration("x".into()).apology().is_none());
        assert!(AgentError::TurnDeadlineExceeded(Duration::from_secs(1))
            .apology()
            .is_none());
        assert!(AgentError::ModelUnavailable("429".into()).is_transient());
        assert!(!AgentError::ModelContractViolation("bad".into()).is_transient());
    }
}
