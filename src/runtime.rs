//! Thread-keyed service around a [`TurnRunner`]: one turn per thread at a time,
//! checkpointed only when it completes.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{info, instrument, warn};

use crate::agent::TurnRunner;
use crate::config::{AgentConfig, BusyPolicy};
use crate::conversation::Conversation;
use crate::error::{AgentError, Result};
use crate::events::{EventSender, TurnEvent};
use crate::message::{Message, Role};
use crate::storage::{validate_thread_id, ConversationStore};

/// A thread's turn lock plus the number of permits (running or waiting) that
/// refer to it. The entry is removed when the last permit goes away.
struct ThreadSlot {
    lock: Arc<Mutex<()>>,
    users: usize,
}

type LockMap = Arc<StdMutex<HashMap<String, ThreadSlot>>>;

fn lock_map(locks: &LockMap) -> MutexGuard<'_, HashMap<String, ThreadSlot>> {
    locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Exclusive right to run a turn on one thread. Dropping it (including when the
/// turn future is cancelled, while running or still queued) releases the thread
/// and prunes the lock entry once nobody else uses it.
struct ThreadPermit {
    thread_id: String,
    locks: LockMap,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ThreadPermit {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = lock_map(&self.locks);
        if let Some(slot) = locks.get_mut(&self.thread_id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                locks.remove(&self.thread_id);
            }
        }
    }
}

pub struct ChatService<R: TurnRunner + 'static, S: ConversationStore + 'static> {
    runner: Arc<R>,
    store: Arc<S>,
    locks: LockMap,
    busy_policy: BusyPolicy,
    turn_deadline: Duration,
}

impl<R: TurnRunner + 'static, S: ConversationStore + 'static> Clone for ChatService<R, S> {
    fn clone(&self) -> Self {
        Self {
            runner: Arc::clone(&self.runner),
            store: Arc::clone(&self.store),
            locks: Arc::clone(&self.locks),
            busy_policy: self.busy_policy,
            turn_deadline: self.turn_deadline,
        }
    }
}

impl<R: TurnRunner + 'static, S: ConversationStore + 'static> ChatService<R, S> {
    pub fn new(runner: R, store: S) -> Self {
        Self::from_shared(Arc::new(runner), Arc::new(store))
    }

    pub fn from_shared(runner: Arc<R>, store: Arc<S>) -> Self {
        Self {
            runner,
            store,
            locks: Arc::new(StdMutex::new(HashMap::new())),
            busy_policy: BusyPolicy::Queue,
            turn_deadline: Duration::from_secs(300),
        }
    }

    pub fn from_config(runner: R, store: S, cfg: &AgentConfig) -> Self {
        Self::new(runner, store)
            .with_busy_policy(cfg.busy_policy)
            .with_turn_deadline(cfg.turn_deadline())
    }

    pub fn with_busy_policy(mut self, policy: BusyPolicy) -> Self {
        self.busy_policy = policy;
        self
    }

    pub fn with_turn_deadline(mut self, deadline: Duration) -> Self {
        self.turn_deadline = deadline;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Stored conversation for a thread; empty if the thread has never completed a turn.
    pub async fn history(&self, thread_id: &str) -> Result<Conversation> {
        validate_thread_id(thread_id)?;
        self.store.load(thread_id).await
    }

    /// Runs one turn and returns the checkpointed conversation.
    ///
    /// `messages` must be non-empty and contain only user or system messages; the
    /// last one is the turn input, earlier ones are appended to the history first.
    pub async fn invoke(&self, thread_id: &str, messages: Vec<Message>) -> Result<Conversation> {
        self.run_exclusive(thread_id, messages, None).await
    }

    /// Same as [`invoke`](Self::invoke), but runs in a background task and yields
    /// progress events. The stream always ends with `TurnComplete` or `Error`.
    pub fn stream(
        &self,
        thread_id: impl Into<String>,
        messages: Vec<Message>,
    ) -> UnboundedReceiverStream<TurnEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let service = self.clone();
        let thread_id = thread_id.into();
        tokio::spawn(async move {
            let outcome = service
                .run_exclusive(&thread_id, messages, Some(&tx))
                .await;
            let last = match outcome {
                Ok(conversation) => TurnEvent::TurnComplete {
                    thread_id,
                    conversation,
                },
                Err(err) => TurnEvent::Error {
                    message: err.to_string(),
                    apology: err.apology(),
                },
            };
            let _ = tx.send(last);
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn acquire(&self, thread_id: &str) -> Result<ThreadPermit> {
        let lock = {
            let mut locks = lock_map(&self.locks);
            let slot = locks
                .entry(thread_id.to_string())
                .or_insert_with(|| ThreadSlot {
                    lock: Arc::new(Mutex::new(())),
                    users: 0,
                });
            slot.users += 1;
            Arc::clone(&slot.lock)
        };
        // registered before waiting, so a cancelled or rejected wait still unregisters
        let mut permit = ThreadPermit {
            thread_id: thread_id.to_string(),
            locks: Arc::clone(&self.locks),
            guard: None,
        };
        let guard = match self.busy_policy {
            BusyPolicy::Queue => lock.lock_owned().await,
            BusyPolicy::Reject => lock
                .try_lock_owned()
                .map_err(|_| AgentError::ThreadBusy(thread_id.to_string()))?,
        };
        permit.guard = Some(guard);
        Ok(permit)
    }

    #[instrument(skip(self, messages, events), fields(inputs = messages.len()))]
    async fn run_exclusive(
        &self,
        thread_id: &str,
        messages: Vec<Message>,
        events: Option<&EventSender>,
    ) -> Result<Conversation> {
        validate_thread_id(thread_id)?;
        let (leading, input) = split_input(messages)?;

        let _permit = self.acquire(thread_id).await?;
        let history = self.store.load(thread_id).await?.with_messages(leading);

        let outcome = tokio::time::timeout(
            self.turn_deadline,
            self.runner.run(history, input, events),
        )
        .await
        .map_err(|_| AgentError::TurnDeadlineExceeded(self.turn_deadline))
        .and_then(|result| result);

        let conversation = match outcome {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!(error = %err, "turn failed, nothing checkpointed");
                return Err(err);
            }
        };
        conversation.ensure_settled()?;
        self.store.checkpoint(thread_id, &conversation).await?;
        info!(messages = conversation.len(), "turn checkpointed");
        Ok(conversation)
    }
}

fn split_input(mut messages: Vec<Message>) -> Result<(Vec<Message>, Message)> {
    if let Some(bad) = messages
        .iter()
        .find(|m| !matches!(m.role, Role::User | Role::System))
    {
        return Err(AgentError::InvalidInput(format!(
            "only user or system messages can be submitted, got {:?}",
            bad.role
        )));
    }
    let input = messages
        .pop()
        .ok_or_else(|| AgentError::InvalidInput("no input messages".into()))?;
    Ok((messages, input))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryConversationStore;
    use crate::{Agent, StubModel};
    use async_trait::async_trait;
    use futures::StreamExt;

    struct Sleepy;

    #[async_trait]
    impl TurnRunner for Sleepy {
        async fn run(
            &self,
            history: Conversation,
            new_input: Message,
            _events: Option<&EventSender>,
        ) -> Result<Conversation> {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(history
                .with_message(new_input)
                .with_message(Message::assistant("slept")))
        }
    }

    #[tokio::test]
    async fn checkpoints_successful_turns() {
        let model = StubModel::new(vec![r#"{"action":"respond","content":"Hi there"}"#.into()]);
        let service = ChatService::new(Agent::new(model), InMemoryConversationStore::new());

        let convo = service
            .invoke("t1", vec![Message::user("hello")])
            .await
            .unwrap();

        assert_eq!(convo.len(), 2);
        assert_eq!(service.history("t1").await.unwrap(), convo);
        assert!(service.history("t2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_turns_leave_the_checkpoint_alone() {
        let model = StubModel::new(vec![r#"{"action":"choose","label":"x"}"#.into()]);
        let service = ChatService::new(Agent::new(model), InMemoryConversationStore::new());

        let err = service
            .invoke("t1", vec![Message::user("hello")])
            .await
            .unwrap_err();

        assert!(matches!(err, AgentError::ModelContractViolation(_)));
        assert!(service.history("t1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rejects_empty_and_assistant_input() {
        let service = ChatService::new(Sleepy, InMemoryConversationStore::new());
        assert!(matches!(
            service.invoke("t", vec![]).await,
            Err(AgentError::InvalidInput(_))
        ));
        assert!(matches!(
            service.invoke("t", vec![Message::assistant("x")]).await,
            Err(AgentError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn deadline_fails_the_turn() {
        let service = ChatService::new(Sleepy, InMemoryConversationStore::new())
            .with_turn_deadline(Duration::from_millis(20));
        let err = service
            .invoke("t", vec![Message::user("hi")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TurnDeadlineExceeded(_)));
        assert!(service.history("t").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reject_policy_reports_busy_threads() {
        let service = ChatService::new(Sleepy, InMemoryConversationStore::new())
            .with_busy_policy(BusyPolicy::Reject);

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.invoke("t", vec![Message::user("a")]).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let err = service
            .invoke("t", vec![Message::user("b")])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::ThreadBusy(_)));
        // other threads are unaffected
        service.invoke("u", vec![Message::user("c")]).await.unwrap();

        first.await.unwrap().unwrap();
        assert_eq!(service.history("t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn lock_entries_are_pruned() {
        let service = ChatService::new(Sleepy, InMemoryConversationStore::new())
            .with_turn_deadline(Duration::from_secs(5));
        service.invoke("t", vec![Message::user("a")]).await.unwrap();
        assert!(lock_map(&service.locks).is_empty());
    }

    #[tokio::test]
    async fn cancelled_waiters_do_not_leak_lock_entries() {
        let service = ChatService::new(Sleepy, InMemoryConversationStore::new());

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.invoke("t", vec![Message::user("a")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let waited = tokio::time::timeout(
            Duration::from_millis(20),
            service.invoke("t", vec![Message::user("b")]),
        )
        .await;
        assert!(waited.is_err());
        assert_eq!(lock_map(&service.locks)["t"].users, 1);

        first.await.unwrap().unwrap();
        assert!(lock_map(&service.locks).is_empty());
        assert_eq!(service.history("t").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_attempts_unregister() {
        let service = ChatService::new(Sleepy, InMemoryConversationStore::new())
            .with_busy_policy(BusyPolicy::Reject);

        let first = {
            let service = service.clone();
            tokio::spawn(async move { service.invoke("t", vec![Message::user("a")]).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(service.invoke("t", vec![Message::user("b")]).await.is_err());

        first.await.unwrap().unwrap();
        assert!(lock_map(&service.locks).is_empty());
    }

    #[tokio::test]
    async fn stream_ends_with_turn_complete() {
        let model = StubModel::new(vec![r#"{"action":"respond","content":"Quote: 10"}"#.into()]);
        let service = ChatService::new(Agent::new(model), InMemoryConversationStore::new());

        let events: Vec<TurnEvent> = service
            .stream("t", vec![Message::user("quote")])
            .collect()
            .await;

        match events.last().unwrap() {
            TurnEvent::TurnComplete {
                thread_id,
                conversation,
            } => {
                assert_eq!(thread_id, "t");
                assert_eq!(conversation.final_reply(), Some("Quote: 10"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events[0].kind(), "model-delta");
    }

    #[tokio::test]
    async fn stream_reports_errors_with_apology() {
        let model = StubModel::new(vec![]);
        let service = ChatService::new(Agent::new(model), InMemoryConversationStore::new());

        let events: Vec<TurnEvent> = service
            .stream("t", vec![Message::user("quote")])
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            TurnEvent::Error { apology: Some(_), .. }
        ));
    }
}
