//! Orchestration core for a tool-using conversational financial assistant.
//!
//! The crate provides:
//! - A language model abstraction (`LanguageModel`) with an OpenAI/Azure client and a scripted stub.
//! - A tool interface (`Tool` and `ToolRegistry`) with argument validation.
//! - An `Agent` that loops between the model and its tools until it can answer.
//! - A `Supervisor` that routes a shared conversation between specialist agents.
//! - A `ChatService` that serializes turns per thread and checkpoints settled conversations.

mod agent;
mod config;
mod context;
mod conversation;
mod error;
mod events;
mod llm;
mod logging;
mod message;
mod retry;
mod runtime;
#[cfg(feature = "server")]
mod server;
mod storage;
mod supervisor;
mod tool;
mod toolkit;

pub use agent::{Agent, TurnRunner};
pub use config::{
    AgentConfig, AppConfig, BusyPolicy, LoggingConfig, ModelConfig, ModelProvider, ServerConfig,
    StorageBackend, StorageConfig,
};
pub use context::{ContextStrategy, FullContext, WindowedContext};
pub use conversation::Conversation;
pub use error::{AgentError, Result};
pub use events::{EventSender, TurnEvent};
pub use llm::{LanguageModel, ModelCompletion, OpenAIClient, StubModel};
pub use logging::init_tracing;
pub use message::{Artifact, Message, Role, ToolCall};
pub use retry::RetryPolicy;
pub use runtime::ChatService;
#[cfg(feature = "server")]
pub use server::{ChatServer, InvokeRequest, InvokeResponse};
#[cfg(feature = "persistence")]
pub use storage::SqlConversationStore;
pub use storage::{
    store_from_config, validate_thread_id, ConversationStore, FileConversationStore,
    InMemoryConversationStore,
};
pub use supervisor::{
    RouterDecision, SpecialistId, Supervisor, SupervisorRun, SupervisorState, FINISH,
};
pub use tool::{validate_arguments, SideEffect, Tool, ToolDescription, ToolOutput, ToolRegistry};
pub use toolkit::{registry_from, required_credential, string_arguments, FunctionTool};
