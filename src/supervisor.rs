//! Multi-agent mode: a router picks the next specialist until it decides to finish.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, instrument, warn};

use crate::agent::{Agent, TurnRunner};
use crate::config::AppConfig;
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::events::{emit, EventSender, TurnEvent};
use crate::llm::LanguageModel;
use crate::message::{Message, Role};

/// Label the router returns when the turn is done.
pub const FINISH: &str = "FINISH";

/// Index of a registered specialist. Only produced by [`RouterDecision::decode`],
/// so it always refers to an existing specialist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialistId(usize);

impl SpecialistId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterDecision {
    Delegate(SpecialistId),
    Finish,
}

impl RouterDecision {
    /// Decodes a constrained-choice label against the closed set of specialist names.
    pub fn decode<S: AsRef<str>>(label: &str, specialists: &[S]) -> Result<Self> {
        let label = label.trim();
        if label == FINISH {
            return Ok(RouterDecision::Finish);
        }
        specialists
            .iter()
            .position(|name| name.as_ref() == label)
            .map(|index| RouterDecision::Delegate(SpecialistId(index)))
            .ok_or_else(|| {
                AgentError::ModelContractViolation(format!(
                    "router returned `{label}`, which is neither a specialist nor {FINISH}"
                ))
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorState {
    Routing,
    Specialist(String),
    Finished,
}

/// Conversation plus the states the supervisor passed through.
#[derive(Debug, Clone)]
pub struct SupervisorRun {
    pub conversation: Conversation,
    pub states: Vec<SupervisorState>,
}

impl SupervisorRun {
    pub fn final_state(&self) -> Option<&SupervisorState> {
        self.states.last()
    }
}

struct Specialist<M: LanguageModel> {
    name: String,
    description: String,
    agent: Agent<M>,
}

/// Routes a shared conversation between tool-restricted specialist agents.
///
/// Only a specialist's final text crosses back into the shared conversation; its
/// tool calls and results stay inside its own loop.
pub struct Supervisor<M: LanguageModel> {
    router: Arc<M>,
    router_prompt: String,
    specialists: Vec<Specialist<M>>,
    max_routes: usize,
    route_timeout: Duration,
    handoff_role: Role,
}

impl<M: LanguageModel> Supervisor<M> {
    pub fn new(router: Arc<M>) -> Self {
        Self {
            router,
            router_prompt: "You are a supervisor tasked with managing a conversation between the \
                            following workers. Given the user request, respond with the worker \
                            to act next. Each worker will perform a task and respond with their \
                            results. When finished, respond with FINISH."
                .to_string(),
            specialists: Vec::new(),
            max_routes: 10,
            route_timeout: Duration::from_secs(60),
            handoff_role: Role::User,
        }
    }

    /// Routing bound from `[agent]`; each routing call may use the client's full
    /// retry budget from `[model]`.
    pub fn from_config(router: Arc<M>, cfg: &AppConfig) -> Self {
        Self::new(router)
            .with_max_routes(cfg.agent.max_routes)
            .with_route_timeout(cfg.model.call_budget())
    }

    pub fn with_router_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.router_prompt = prompt.into();
        self
    }

    pub fn with_max_routes(mut self, max_routes: usize) -> Self {
        self.max_routes = max_routes.max(1);
        self
    }

    pub fn with_route_timeout(mut self, timeout: Duration) -> Self {
        self.route_timeout = timeout;
        self
    }

    /// Role under which a specialist's reply is appended. Defaults to `User`;
    /// `Assistant` is the alternative.
    pub fn with_handoff_role(mut self, role: Role) -> Self {
        self.handoff_role = role;
        self
    }

    /// Registers a specialist. Names must be unique and must not be `FINISH`.
    pub fn add_specialist(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Agent<M>,
    ) -> Result<()> {
        let name = name.into();
        if name == FINISH || self.specialists.iter().any(|s| s.name == name) {
            return Err(AgentError::Configuration(format!(
                "specialist name `{name}` is reserved or already registered"
            )));
        }
        self.specialists.push(Specialist {
            agent: agent.with_name(name.clone()),
            name,
            description: description.into(),
        });
        Ok(())
    }

    pub fn with_specialist(
        mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        agent: Agent<M>,
    ) -> Result<Self> {
        self.add_specialist(name, description, agent)?;
        Ok(self)
    }

    pub fn specialist_names(&self) -> Vec<String> {
        self.specialists.iter().map(|s| s.name.clone()).collect()
    }

    /// The closed set of labels the router may answer with.
    pub fn labels(&self) -> Vec<String> {
        let mut labels = self.specialist_names();
        labels.push(FINISH.to_string());
        labels
    }

    fn routing_request(&self, history: &Conversation) -> Vec<Message> {
        let roster: Vec<String> = self
            .specialists
            .iter()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect();
        let mut request = vec![Message::system(format!(
            "{}\n\nWorkers:\n{}",
            self.router_prompt,
            roster.join("\n")
        ))];
        request.extend(history.iter().cloned());
        request.push(Message::system(format!(
            "Given the conversation above, who should act next? Or should we {FINISH}? \
             Select one of: {}",
            self.labels().join(", ")
        )));
        request
    }

    /// Asks the router for the next step.
    pub async fn route(&self, history: &Conversation) -> Result<RouterDecision> {
        let request = self.routing_request(history);
        let labels = self.labels();
        let label = tokio::time::timeout(
            self.route_timeout,
            self.router.complete_choice(&request, &labels),
        )
        .await
        .map_err(|_| AgentError::ModelTimeout(self.route_timeout))??;
        RouterDecision::decode(&label, &self.specialist_names())
    }

    pub async fn run_turn(&self, history: Conversation, new_input: Message) -> Result<Conversation> {
        Ok(self.run_turn_traced(history, new_input, None).await?.conversation)
    }

    #[instrument(skip_all, fields(specialists = self.specialists.len()))]
    pub async fn run_turn_traced(
        &self,
        history: Conversation,
        new_input: Message,
        events: Option<&EventSender>,
    ) -> Result<SupervisorRun> {
        if !matches!(new_input.role, Role::User | Role::System) {
            return Err(AgentError::InvalidInput(format!(
                "a turn must start with a user or system message, got {:?}",
                new_input.role
            )));
        }
        if self.specialists.is_empty() {
            return Err(AgentError::Configuration(
                "supervisor has no specialists".into(),
            ));
        }
        history.ensure_settled()?;

        let mut shared = history.with_message(new_input);
        let mut states = vec![SupervisorState::Routing];

        for _ in 0..self.max_routes {
            match self.route(&shared).await? {
                RouterDecision::Finish => {
                    info!("router finished the turn");
                    states.push(SupervisorState::Finished);
                    return Ok(SupervisorRun {
                        conversation: shared,
                        states,
                    });
                }
                RouterDecision::Delegate(id) => {
                    let specialist = &self.specialists[id.index()];
                    info!(specialist = %specialist.name, "routing to specialist");
                    states.push(SupervisorState::Specialist(specialist.name.clone()));
                    emit(
                        events,
                        TurnEvent::Routed {
                            specialist: specialist.name.clone(),
                        },
                    );

                    let sub = specialist.agent.continue_turn(shared.clone(), events).await?;
                    let reply = sub.final_reply().unwrap_or_default().to_string();
                    let handoff = Message {
                        role: self.handoff_role,
                        ..Message::assistant(reply)
                    }
                    .with_name(specialist.name.clone());
                    shared = shared.with_message(handoff);
                    states.push(SupervisorState::Routing);
                }
            }
        }

        warn!(routes = self.max_routes, "supervisor hit the routing limit");
        Err(AgentError::LoopBoundExceeded {
            rounds: self.max_routes,
            transcript: Box::new(shared),
        })
    }
}

#[async_trait]
impl<M: LanguageModel> TurnRunner for Supervisor<M> {
    async fn run(
        &self,
        history: Conversation,
        new_input: Message,
        events: Option<&EventSender>,
    ) -> Result<Conversation> {
        Ok(self
            .run_turn_traced(history, new_input, events)
            .await?
            .conversation)
    }
}
