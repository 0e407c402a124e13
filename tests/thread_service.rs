use std::time::Duration;

use async_trait::async_trait;
use finchat_engine::{
    Agent, AgentError, Artifact, BusyPolicy, ChatService, Conversation, ConversationStore,
    FileConversationStore, InMemoryConversationStore, Message, Result, Role, StubModel, Tool,
    ToolCall, ToolOutput, ToolRegistry,
};
use serde_json::{json, Value};
use tempfile::TempDir;

struct SlowQuote;

#[async_trait]
impl Tool for SlowQuote {
    fn name(&self) -> &str {
        "get_stock_price"
    }

    fn description(&self) -> &str {
        "Latest price, slowly"
    }

    async fn call(&self, _input: Value) -> Result<ToolOutput> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(ToolOutput::text("{\"price\": 42.0}"))
    }
}

fn settled_sample() -> Conversation {
    Conversation::new()
        .with_message(Message::user("plot NVDA"))
        .with_message(Message::assistant_with_tool_calls(
            "",
            vec![ToolCall::new("call_1", "python_repl", json!({"code": "plot()"}))],
        ))
        .with_message(
            Message::tool_result("call_1", "python_repl", "chart ready")
                .with_artifact(Artifact::png(vec![0x89, b'P', b'N', b'G'])),
        )
        .with_message(Message::assistant("Here is the chart."))
}

#[tokio::test]
async fn load_after_checkpoint_is_identity() {
    let dir = TempDir::new().unwrap();
    let stores: Vec<Box<dyn ConversationStore>> = vec![
        Box::new(InMemoryConversationStore::new()),
        Box::new(FileConversationStore::new(dir.path())),
    ];

    for store in stores {
        store.checkpoint("thread-a", &settled_sample()).await.unwrap();
        assert_eq!(store.load("thread-a").await.unwrap(), settled_sample());
        assert!(store.load("thread-b").await.unwrap().is_empty());
    }
}

#[cfg(feature = "persistence")]
#[tokio::test]
async fn sqlite_load_after_checkpoint_is_identity() {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("threads.db").display());
    let store = finchat_engine::SqlConversationStore::connect(&url)
        .await
        .unwrap();

    store.checkpoint("thread-a", &settled_sample()).await.unwrap();
    assert_eq!(store.load("thread-a").await.unwrap(), settled_sample());
}

#[tokio::test]
async fn same_thread_turns_are_serialized() {
    let model = StubModel::new(vec![
        json!({"action": "call_tool", "name": "get_stock_price", "arguments": {}}).to_string(),
        json!({"action": "respond", "content": "first"}).to_string(),
        json!({"action": "call_tool", "name": "get_stock_price", "arguments": {}}).to_string(),
        json!({"action": "respond", "content": "second"}).to_string(),
    ]);
    let agent = Agent::new(model).with_tools(ToolRegistry::new().with_tool(SlowQuote));
    let service = ChatService::new(agent, InMemoryConversationStore::new());

    let (a, b) = tokio::join!(
        service.invoke("shared", vec![Message::user("price?")]),
        service.invoke("shared", vec![Message::user("price again?")]),
    );
    a.unwrap();
    b.unwrap();

    let stored = service.history("shared").await.unwrap();
    assert!(stored.is_settled());
    let roles: Vec<Role> = stored.iter().map(|m| m.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Assistant,
            Role::User,
            Role::Assistant,
            Role::Tool,
            Role::Assistant,
        ]
    );
    assert_eq!(stored.messages()[3].content, "first");
    assert_eq!(stored.messages()[7].content, "second");
}

#[tokio::test]
async fn busy_thread_is_rejected_under_reject_policy() {
    let model = StubModel::new(vec![
        json!({"action": "call_tool", "name": "get_stock_price", "arguments": {}}).to_string(),
        json!({"action": "respond", "content": "done"}).to_string(),
    ]);
    let agent = Agent::new(model).with_tools(ToolRegistry::new().with_tool(SlowQuote));
    let service = ChatService::new(agent, InMemoryConversationStore::new())
        .with_busy_policy(BusyPolicy::Reject);

    let second = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        service.invoke("shared", vec![Message::user("again")]).await
    };
    let (first, second) = tokio::join!(
        service.invoke("shared", vec![Message::user("price?")]),
        second
    );

    first.unwrap();
    assert!(matches!(second, Err(AgentError::ThreadBusy(_))));
    assert_eq!(service.history("shared").await.unwrap().len(), 4);
}

#[tokio::test]
async fn file_backed_service_resumes_threads() {
    let dir = TempDir::new().unwrap();
    let first = ChatService::new(
        Agent::new(StubModel::new(vec!["MSFT is 420.".into()])),
        FileConversationStore::new(dir.path()),
    );
    first
        .invoke("t1", vec![Message::user("MSFT?")])
        .await
        .unwrap();

    // a fresh service over the same directory picks the thread up
    let model = StubModel::new(vec!["It was 415 last week.".into()]);
    let second = ChatService::new(
        Agent::new(model.clone()),
        FileConversationStore::new(dir.path()),
    );
    let convo = second
        .invoke("t1", vec![Message::user("And last week?")])
        .await
        .unwrap();

    assert_eq!(convo.len(), 4);
    assert_eq!(model.requests()[0][1].content, "MSFT?");
}

#[tokio::test]
async fn leading_system_messages_are_kept() {
    let service = ChatService::new(
        Agent::new(StubModel::new(vec!["ok".into()])),
        InMemoryConversationStore::new(),
    );

    let convo = service
        .invoke(
            "t1",
            vec![
                Message::system("User prefers EUR"),
                Message::user("price of SAP?"),
            ],
        )
        .await
        .unwrap();

    assert_eq!(convo.messages()[0].role, Role::System);
    assert_eq!(convo.len(), 3);
}
