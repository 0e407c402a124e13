use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::AppConfig;
use crate::context::{ContextStrategy, FullContext, WindowedContext};
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::events::{emit, EventSender, TurnEvent};
use crate::llm::{LanguageModel, ModelCompletion};
use crate::message::{Message, Role, ToolCall};
use crate::tool::{ToolDescription, ToolOutput, ToolRegistry};

/// Anything that can take a settled conversation plus one new input and produce
/// the next settled conversation. Implemented by [`Agent`] and by
/// [`crate::Supervisor`] so the runtime can host either.
#[async_trait]
pub trait TurnRunner: Send + Sync {
    async fn run(
        &self,
        history: Conversation,
        new_input: Message,
        events: Option<&EventSender>,
    ) -> Result<Conversation>;
}

/// Tool-calling agent loop: Awaiting-Model, Tool-Dispatch, Terminal.
pub struct Agent<M: LanguageModel> {
    name: Option<String>,
    system_prompt: String,
    model: Arc<M>,
    tools: ToolRegistry,
    max_rounds: usize,
    tool_timeout: Duration,
    model_timeout: Duration,
    concurrent_tools: bool,
    context: Arc<dyn ContextStrategy>,
}

impl<M: LanguageModel> Agent<M> {
    pub fn new(model: Arc<M>) -> Self {
        Self {
            name: None,
            system_prompt: "You are a helpful financial assistant.".to_string(),
            model,
            tools: ToolRegistry::new(),
            max_rounds: 25,
            tool_timeout: Duration::from_secs(30),
            model_timeout: Duration::from_secs(120),
            concurrent_tools: true,
            context: Arc::new(FullContext),
        }
    }

    /// Agent settings come from `[agent]`; the model timeout covers the client's
    /// full retry budget from `[model]`.
    pub fn from_config(model: Arc<M>, tools: ToolRegistry, cfg: &AppConfig) -> Self {
        let agent = Self::new(model)
            .with_system_prompt(cfg.agent.system_prompt.clone())
            .with_tools(tools)
            .with_max_rounds(cfg.agent.max_rounds)
            .with_tool_timeout(cfg.agent.tool_timeout())
            .with_model_timeout(cfg.model.call_budget())
            .with_concurrent_tools(cfg.agent.concurrent_tools);
        match cfg.agent.context_window {
            Some(window) => agent.with_context_strategy(Arc::new(WindowedContext::new(window))),
            None => agent,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: usize) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn with_tool_timeout(mut self, timeout: Duration) -> Self {
        self.tool_timeout = timeout;
        self
    }

    pub fn with_model_timeout(mut self, timeout: Duration) -> Self {
        self.model_timeout = timeout;
        self
    }

    pub fn with_concurrent_tools(mut self, concurrent: bool) -> Self {
        self.concurrent_tools = concurrent;
        self
    }

    pub fn with_context_strategy(mut self, strategy: Arc<dyn ContextStrategy>) -> Self {
        self.context = strategy;
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn label(&self) -> &str {
        self.name.as_deref().unwrap_or("agent")
    }

    /// Runs one turn: appends `new_input` to a settled `history` and loops between
    /// the model and the tools until the model answers without tool calls.
    pub async fn run_turn(&self, history: Conversation, new_input: Message) -> Result<Conversation> {
        self.run_turn_with_events(history, new_input, None).await
    }

    pub async fn run_turn_with_events(
        &self,
        history: Conversation,
        new_input: Message,
        events: Option<&EventSender>,
    ) -> Result<Conversation> {
        if !matches!(new_input.role, Role::User | Role::System) {
            return Err(AgentError::InvalidInput(format!(
                "a turn must start with a user or system message, got {:?}",
                new_input.role
            )));
        }
        history.ensure_settled()?;
        self.drive(history.with_message(new_input), events).await
    }

    /// Runs the loop on a settled history without adding input. Used when the
    /// latest message was appended by someone else (a supervisor handing off).
    pub async fn continue_turn(
        &self,
        history: Conversation,
        events: Option<&EventSender>,
    ) -> Result<Conversation> {
        history.ensure_settled()?;
        self.drive(history, events).await
    }

    #[instrument(skip_all, fields(agent = %self.label()))]
    async fn drive(
        &self,
        mut working: Conversation,
        events: Option<&EventSender>,
    ) -> Result<Conversation> {
        let tools = self.tools.describe();
        info!(history = working.len(), tools = tools.len(), "starting turn");

        for round in 1..=self.max_rounds {
            debug!(round, "awaiting model");
            let completion = self.call_model(&working, &tools, events).await?;

            if completion.tool_calls.is_empty() {
                let reply = self.authored(Message::assistant(completion.content.unwrap_or_default()));
                info!(round, "turn complete");
                return Ok(working.with_message(reply));
            }

            self.check_call_ids(&working, &completion.tool_calls)?;
            let request = self.authored(completion.into_message());
            debug!(round, calls = request.tool_calls.len(), "dispatching tools");
            let results = self.dispatch(&request.tool_calls, events).await?;
            working = working.with_message(request).with_messages(results);
        }

        warn!(rounds = self.max_rounds, "turn hit the round limit");
        Err(AgentError::LoopBoundExceeded {
            rounds: self.max_rounds,
            transcript: Box::new(working),
        })
    }

    fn authored(&self, message: Message) -> Message {
        match &self.name {
            Some(name) => message.with_name(name.clone()),
            None => message,
        }
    }

    /// The system prompt is reattached on every round and never stored.
    fn build_request(&self, working: &Conversation) -> Vec<Message> {
        let mut request = vec![Message::system(self.system_prompt.clone())];
        request.extend(self.context.context_messages(working.messages()));
        request
    }

    async fn call_model(
        &self,
        working: &Conversation,
        tools: &[ToolDescription],
        events: Option<&EventSender>,
    ) -> Result<ModelCompletion> {
        let request = self.build_request(working);
        let request = request.as_slice();
        let call = async {
            match events {
                None => self.model.complete_chat(request, tools).await,
                Some(sink) => {
                    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
                    let agent = self.name.clone();
                    let forward = async {
                        while let Some(delta) = rx.recv().await {
                            emit(
                                Some(sink),
                                TurnEvent::ModelDelta {
                                    agent: agent.clone(),
                                    delta,
                                },
                            );
                        }
                    };
                    let complete = async move {
                        let result = self.model.complete_chat_streaming(request, tools, &tx).await;
                        drop(tx);
                        result
                    };
                    let (result, ()) = tokio::join!(complete, forward);
                    result
                }
            }
        };
        tokio::time::timeout(self.model_timeout, call)
            .await
            .map_err(|_| AgentError::ModelTimeout(self.model_timeout))?
    }

    fn check_call_ids(&self, working: &Conversation, calls: &[ToolCall]) -> Result<()> {
        let mut seen: HashSet<&str> = working
            .iter()
            .flat_map(|m| m.tool_calls.iter())
            .map(|c| c.id.as_str())
            .collect();
        for call in calls {
            if call.id.is_empty() || !seen.insert(call.id.as_str()) {
                return Err(AgentError::ModelContractViolation(format!(
                    "tool call id `{}` for `{}` is empty or reused",
                    call.id, call.name
                )));
            }
        }
        Ok(())
    }

    /// Invokes every call of one batch and returns their results in request order.
    /// Individual failures become error results; only fatal errors abort.
    async fn dispatch(&self, calls: &[ToolCall], events: Option<&EventSender>) -> Result<Vec<Message>> {
        for call in calls {
            emit(
                events,
                TurnEvent::ToolCallStarted {
                    agent: self.name.clone(),
                    call: call.clone(),
                },
            );
        }

        let outcomes: Vec<Result<ToolOutput>> = if self.concurrent_tools {
            join_all(calls.iter().map(|call| self.invoke_tool(call))).await
        } else {
            let mut outcomes = Vec::with_capacity(calls.len());
            for call in calls {
                outcomes.push(self.invoke_tool(call).await);
            }
            outcomes
        };

        let mut results = Vec::with_capacity(calls.len());
        for (call, outcome) in calls.iter().zip(outcomes) {
            let (message, is_error) = match outcome {
                Ok(output) => {
                    let message = Message::tool_result(&call.id, &call.name, output.content);
                    let message = match output.artifact {
                        Some(artifact) => message.with_artifact(artifact),
                        None => message,
                    };
                    (message, false)
                }
                Err(err) if err.is_fatal() => {
                    warn!(tool = %call.name, error = %err, "fatal tool error, aborting turn");
                    return Err(err);
                }
                Err(err) => {
                    warn!(tool = %call.name, call_id = %call.id, error = %err, "tool call failed");
                    let message = Message::tool_result(&call.id, &call.name, format!("Error: {err}"));
                    (message, true)
                }
            };
            emit(
                events,
                TurnEvent::ToolCallResult {
                    agent: self.name.clone(),
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content: message.content.clone(),
                    is_error,
                    artifact: message.artifact.clone(),
                },
            );
            results.push(message);
        }
        Ok(results)
    }

    async fn invoke_tool(&self, call: &ToolCall) -> Result<ToolOutput> {
        debug!(tool = %call.name, call_id = %call.id, "invoking tool");
        tokio::time::timeout(
            self.tool_timeout,
            self.tools.call(&call.name, call.arguments.clone()),
        )
        .await
        .map_err(|_| AgentError::ToolTimeout {
            name: call.name.clone(),
            elapsed: self.tool_timeout,
        })?
    }
}

#[async_trait]
impl<M: LanguageModel> TurnRunner for Agent<M> {
    async fn run(
        &self,
        history: Conversation,
        new_input: Message,
        events: Option<&EventSender>,
    ) -> Result<Conversation> {
        self.run_turn_with_events(history, new_input, events).await
    }
}
