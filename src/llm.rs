//! Chat-completion clients and the contract the agent loop consumes.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::{ModelConfig, ModelProvider};
use crate::error::{AgentError, Result};
use crate::message::{Message, Role, ToolCall};
use crate::retry::RetryPolicy;
use crate::tool::ToolDescription;

/// Result of a chat completion request: a reply, tool-call requests, or both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelCompletion {
    pub content: Option<String>,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelCompletion {
    pub fn reply(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            tool_calls: Vec::new(),
        }
    }

    pub fn into_message(self) -> Message {
        Message::assistant_with_tool_calls(self.content.unwrap_or_default(), self.tool_calls)
    }
}

/// Minimal abstraction around a chat completion provider.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion>;

    /// Same as [`LanguageModel::complete_chat`], forwarding text deltas as they arrive.
    async fn complete_chat_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<ModelCompletion> {
        let completion = self.complete_chat(messages, tools).await?;
        if let Some(content) = completion.content.as_ref().filter(|c| !c.is_empty()) {
            let _ = deltas.send(content.clone());
        }
        Ok(completion)
    }

    /// Constrained mode: the answer must be exactly one of `choices`.
    async fn complete_choice(&self, messages: &[Message], choices: &[String]) -> Result<String>;
}

fn new_call_id() -> String {
    format!("call_{}", uuid::Uuid::new_v4().simple())
}

fn classify_status(status: reqwest::StatusCode, body: &str) -> AgentError {
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return AgentError::ModelUnavailable(format!("provider returned {status}: {body}"));
    }
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return AgentError::Configuration(format!("provider rejected credentials ({status})"));
    }
    AgentError::LanguageModel(format!("request failed with {status}: {body}"))
}

fn classify_transport(err: reqwest::Error, timeout: std::time::Duration) -> AgentError {
    if err.is_timeout() {
        AgentError::ModelTimeout(timeout)
    } else {
        AgentError::ModelUnavailable(format!("transport error: {err}"))
    }
}

fn parse_arguments(raw: &str) -> Value {
    if raw.trim().is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Client for OpenAI-compatible chat completions, including Azure OpenAI deployments.
#[derive(Clone)]
pub struct OpenAIClient {
    http: reqwest::Client,
    url: String,
    auth: (String, String),
    model: String,
    temperature: f32,
    timeout: std::time::Duration,
    retry: RetryPolicy,
}

impl std::fmt::Debug for OpenAIClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIClient")
            .field("url", &self.url)
            .field("model", &self.model)
            .finish()
    }
}

impl OpenAIClient {
    pub fn from_config(cfg: &ModelConfig) -> Result<Self> {
        let api_key = cfg
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| AgentError::Configuration("missing model API key".into()))?;

        let (url, auth) = match cfg.provider {
            ModelProvider::Azure => {
                let endpoint = cfg.endpoint.as_deref().ok_or_else(|| {
                    AgentError::Configuration("missing Azure OpenAI endpoint".into())
                })?;
                let version = cfg.api_version.as_deref().ok_or_else(|| {
                    AgentError::Configuration("missing Azure OpenAI api version".into())
                })?;
                (
                    format!(
                        "{}/openai/deployments/{}/chat/completions?api-version={version}",
                        endpoint.trim_end_matches('/'),
                        cfg.model
                    ),
                    ("api-key".to_string(), api_key),
                )
            }
            ModelProvider::OpenAi => (
                format!(
                    "{}/chat/completions",
                    cfg.endpoint
                        .as_deref()
                        .unwrap_or("https://api.openai.com/v1")
                        .trim_end_matches('/')
                ),
                ("authorization".to_string(), format!("Bearer {api_key}")),
            ),
            ModelProvider::Stub => {
                return Err(AgentError::Configuration(
                    "the stub provider has no HTTP client".into(),
                ))
            }
        };

        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(cfg.timeout())
                .build()
                .map_err(|err| AgentError::Configuration(format!("http client error: {err}")))?,
            url,
            auth,
            model: cfg.model.clone(),
            temperature: cfg.temperature,
            timeout: cfg.timeout(),
            retry: cfg.retry_policy(),
        })
    }

    fn to_openai_messages(messages: &[Message]) -> Vec<OpenAiMessage> {
        messages
            .iter()
            .map(|message| {
                let role = match message.role {
                    Role::System => "system",
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::Tool => "tool",
                };
                let tool_calls = if message.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        message
                            .tool_calls
                            .iter()
                            .map(|call| OpenAiToolCall {
                                id: call.id.clone(),
                                r#type: "function".to_string(),
                                function: OpenAiFunctionCall {
                                    name: call.name.clone(),
                                    arguments: call.arguments.to_string(),
                                },
                            })
                            .collect(),
                    )
                };
                let content = if tool_calls.is_some() && message.content.is_empty() {
                    None
                } else {
                    Some(message.content.clone())
                };
                // Tool names are carried by the call id, not a `name` field.
                let name = match message.role {
                    Role::User | Role::Assistant => message.name.clone(),
                    _ => None,
                };
                OpenAiMessage {
                    role: role.to_string(),
                    content,
                    name,
                    tool_call_id: message.tool_call_id.clone(),
                    tool_calls,
                }
            })
            .collect()
    }

    fn to_openai_tools(tools: &[ToolDescription]) -> Option<Vec<OpenAiTool>> {
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| OpenAiTool {
                    r#type: "function".to_string(),
                    function: OpenAiFunction {
                        name: tool.name.clone(),
                        description: Some(tool.description.clone()),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect(),
        )
    }

    fn chat_payload(&self, messages: &[Message], tools: &[ToolDescription], stream: bool) -> Value {
        let mut payload = json!({
            "model": self.model,
            "messages": Self::to_openai_messages(messages),
            "temperature": self.temperature,
            "stream": stream,
        });
        if let Some(tools) = Self::to_openai_tools(tools) {
            payload["tools"] = json!(tools);
            payload["tool_choice"] = json!("auto");
        }
        payload
    }

    async fn post(&self, payload: &Value) -> Result<reqwest::Response> {
        self.retry
            .retry(|attempt| async move {
                debug!(attempt, url = %self.url, "sending chat completion request");
                let resp = self
                    .http
                    .post(&self.url)
                    .header(self.auth.0.as_str(), self.auth.1.as_str())
                    .json(payload)
                    .send()
                    .await
                    .map_err(|err| classify_transport(err, self.timeout))?;
                if resp.status().is_success() {
                    Ok(resp)
                } else {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    Err(classify_status(status, &body))
                }
            })
            .await
    }

    fn completion_from(choice: OpenAiChoiceMessage) -> ModelCompletion {
        let tool_calls = choice
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|call| ToolCall {
                id: if call.id.is_empty() {
                    new_call_id()
                } else {
                    call.id
                },
                name: call.function.name,
                arguments: parse_arguments(&call.function.arguments),
            })
            .collect();
        ModelCompletion {
            content: choice.content,
            tool_calls,
        }
    }
}

#[async_trait]
impl LanguageModel for OpenAIClient {
    async fn complete_chat(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        let payload = self.chat_payload(messages, tools, false);
        let body: OpenAiResponse = self.post(&payload).await?.json().await.map_err(|err| {
            AgentError::ModelContractViolation(format!("unparseable chat response: {err}"))
        })?;
        let first = body.choices.into_iter().next().ok_or_else(|| {
            AgentError::ModelContractViolation("chat response contained no choices".into())
        })?;
        Ok(Self::completion_from(first.message))
    }

    async fn complete_chat_streaming(
        &self,
        messages: &[Message],
        tools: &[ToolDescription],
        deltas: &mpsc::UnboundedSender<String>,
    ) -> Result<ModelCompletion> {
        let payload = self.chat_payload(messages, tools, true);
        let resp = self.post(&payload).await?;

        let mut content = String::new();
        // keyed by the provider's tool-call index so request order is preserved
        let mut calls: BTreeMap<usize, OpenAiToolCallState> = BTreeMap::new();
        let mut lines = SseLines::default();
        let mut stream = resp.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| classify_transport(err, self.timeout))?;
            for line in lines.push(&chunk)? {
                apply_stream_line(&line, &mut content, &mut calls, deltas)?;
            }
        }
        if let Some(line) = lines.finish()? {
            apply_stream_line(&line, &mut content, &mut calls, deltas)?;
        }

        let tool_calls = calls
            .into_values()
            .map(|state| {
                let name = state.name.ok_or_else(|| {
                    AgentError::ModelContractViolation("streamed tool call without a name".into())
                })?;
                Ok(ToolCall {
                    id: state.id.unwrap_or_else(new_call_id),
                    name,
                    arguments: parse_arguments(&state.arguments),
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(ModelCompletion {
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            tool_calls,
        })
    }

    async fn complete_choice(&self, messages: &[Message], choices: &[String]) -> Result<String> {
        let mut payload = self.chat_payload(messages, &[], false);
        payload["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {
                "name": "route",
                "strict": true,
                "schema": {
                    "type": "object",
                    "properties": {"next": {"type": "string", "enum": choices}},
                    "required": ["next"],
                    "additionalProperties": false
                }
            }
        });
        let body: OpenAiResponse = self.post(&payload).await?.json().await.map_err(|err| {
            AgentError::ModelContractViolation(format!("unparseable routing response: {err}"))
        })?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                AgentError::ModelContractViolation("routing response had no content".into())
            })?;
        let decision: RouteChoice = serde_json::from_str(&content).map_err(|err| {
            AgentError::ModelContractViolation(format!(
                "routing response `{content}` is not a choice: {err}"
            ))
        })?;
        Ok(decision.next)
    }
}

#[derive(Debug, Deserialize)]
struct RouteChoice {
    next: String,
}

/// Splits a byte stream into lines. Bytes are only decoded once a full line has
/// arrived, so a character split across network chunks stays intact.
#[derive(Default)]
struct SseLines {
    pending: Vec<u8>,
}

impl SseLines {
    fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=newline).collect();
            lines.push(decode_line(raw)?);
        }
        Ok(lines)
    }

    /// The unterminated tail left when the stream closes, if any.
    fn finish(self) -> Result<Option<String>> {
        if self.pending.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        decode_line(self.pending).map(Some)
    }
}

fn decode_line(raw: Vec<u8>) -> Result<String> {
    String::from_utf8(raw).map_err(|err| {
        AgentError::ModelContractViolation(format!("stream line is not valid UTF-8: {err}"))
    })
}

fn apply_stream_line(
    line: &str,
    content: &mut String,
    calls: &mut BTreeMap<usize, OpenAiToolCallState>,
    deltas: &mpsc::UnboundedSender<String>,
) -> Result<()> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(());
    };
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(());
    }
    let parsed: OpenAiStreamChunk = serde_json::from_str(data).map_err(|err| {
        AgentError::ModelContractViolation(format!("unparseable stream chunk `{data}`: {err}"))
    })?;
    for choice in parsed.choices {
        if let Some(delta) = choice.delta.content.filter(|d| !d.is_empty()) {
            let _ = deltas.send(delta.clone());
            content.push_str(&delta);
        }
        for delta_call in choice.delta.tool_calls.unwrap_or_default() {
            let state = calls.entry(delta_call.index).or_default();
            if let Some(id) = delta_call.id {
                state.id = Some(id);
            }
            if let Some(function) = delta_call.function {
                if let Some(name) = function.name {
                    state.name = Some(name);
                }
                if let Some(args) = function.arguments {
                    state.arguments.push_str(&args);
                }
            }
        }
    }
    Ok(())
}

/// A deterministic model used for tests and demos.
///
/// Each request pops the next scripted directive:
/// `{"action":"respond","content":..}`, `{"action":"call_tool","name":..,"arguments":..}`,
/// `{"action":"call_tools","calls":[{"name":..,"arguments":..}]}` or
/// `{"action":"choose","label":..}`. Anything that is not a directive is
/// returned verbatim as reply text.
pub struct StubModel {
    responses: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<Vec<Message>>>,
    chat_calls: AtomicUsize,
    choice_calls: AtomicUsize,
    issued_ids: AtomicUsize,
}

impl StubModel {
    pub fn new(responses: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            chat_calls: AtomicUsize::new(0),
            choice_calls: AtomicUsize::new(0),
            issued_ids: AtomicUsize::new(0),
        })
    }

    /// Number of `complete_chat` requests served.
    pub fn chat_calls(&self) -> usize {
        self.chat_calls.load(Ordering::SeqCst)
    }

    /// Number of `complete_choice` requests served.
    pub fn choice_calls(&self) -> usize {
        self.choice_calls.load(Ordering::SeqCst)
    }

    /// Every message list this model was asked to complete, in order.
    pub fn requests(&self) -> Vec<Vec<Message>> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn next_directive(&self, messages: &[Message]) -> Result<StubDirective> {
        self.requests
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(messages.to_vec());
        let raw = self
            .responses
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .pop_front()
            .ok_or_else(|| {
                AgentError::LanguageModel("StubModel ran out of scripted responses".into())
            })?;
        Ok(serde_json::from_str(&raw).unwrap_or(StubDirective::Respond { content: raw }))
    }

    fn call_id(&self, id: Option<String>) -> String {
        id.unwrap_or_else(|| format!("call_{}", self.issued_ids.fetch_add(1, Ordering::SeqCst)))
    }
}

#[derive(Debug, Deserialize)]
struct StubCall {
    #[serde(default)]
    id: Option<String>,
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum StubDirective {
    Respond {
        content: String,
    },
    CallTool {
        #[serde(default)]
        id: Option<String>,
        name: String,
        #[serde(default)]
        arguments: Value,
    },
    CallTools {
        calls: Vec<StubCall>,
    },
    Choose {
        label: String,
    },
}

#[async_trait]
impl LanguageModel for StubModel {
    async fn complete_chat(
        &self,
        messages: &[Message],
        _tools: &[ToolDescription],
    ) -> Result<ModelCompletion> {
        self.chat_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_directive(messages)? {
            StubDirective::Respond { content } => Ok(ModelCompletion::reply(content)),
            StubDirective::CallTool {
                id,
                name,
                arguments,
            } => Ok(ModelCompletion {
                content: None,
                tool_calls: vec![ToolCall {
                    id: self.call_id(id),
                    name,
                    arguments,
                }],
            }),
            StubDirective::CallTools { calls } => Ok(ModelCompletion {
                content: None,
                tool_calls: calls
                    .into_iter()
                    .map(|call| ToolCall {
                        id: self.call_id(call.id),
                        name: call.name,
                        arguments: call.arguments,
                    })
                    .collect(),
            }),
            StubDirective::Choose { label } => Err(AgentError::ModelContractViolation(format!(
                "chat request answered with a routing label `{label}`"
            ))),
        }
    }

    async fn complete_choice(&self, messages: &[Message], _choices: &[String]) -> Result<String> {
        self.choice_calls.fetch_add(1, Ordering::SeqCst);
        match self.next_directive(messages)? {
            StubDirective::Choose { label } => Ok(label),
            StubDirective::Respond { content } => Ok(content),
            other => Err(AgentError::ModelContractViolation(format!(
                "routing request answered with {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiMessage {
    role: String,
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiToolCall {
    #[serde(default)]
    id: String,
    r#type: String,
    function: OpenAiFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunctionCall {
    name: String,
    arguments: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiTool {
    r#type: String,
    function: OpenAiFunction,
}

#[derive(Debug, Serialize, Deserialize)]
struct OpenAiFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoiceMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCall>>,
}

#[derive(Default)]
struct OpenAiToolCallState {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiStreamChunk {
    choices: Vec<OpenAiDeltaChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiDeltaChoice {
    delta: OpenAiDelta,
}

#[derive(Debug, Deserialize)]
struct OpenAiDelta {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<OpenAiToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct OpenAiToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    #[serde(default)]
    function: Option<OpenAiFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct OpenAiFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn azure_config() -> ModelConfig {
        ModelConfig {
            provider: ModelProvider::Azure,
            model: "gpt-4o".into(),
            api_key: Some("secret".into()),
            endpoint: Some("https://example.openai.azure.com/".into()),
            api_version: Some("2024-06-01".into()),
            ..ModelConfig::default()
        }
    }

    #[test]
    fn missing_credentials_are_configuration_errors() {
        let mut cfg = azure_config();
        cfg.api_key = None;
        assert!(matches!(
            OpenAIClient::from_config(&cfg),
            Err(AgentError::Configuration(_))
        ));

        let mut cfg = azure_config();
        cfg.endpoint = None;
        assert!(matches!(
            OpenAIClient::from_config(&cfg),
            Err(AgentError::Configuration(_))
        ));
    }

    #[test]
    fn stream_lines_keep_characters_split_across_chunks() {
        let line = "data: {\"choices\":[{\"delta\":{\"content\":\"café €\"}}]}\n";
        let bytes = line.as_bytes();
        // split between the two bytes of 'é'
        let split = line.find('é').unwrap() + 1;

        let mut lines = SseLines::default();
        assert!(lines.push(&bytes[..split]).unwrap().is_empty());
        let decoded = lines.push(&bytes[split..]).unwrap();
        assert_eq!(decoded, vec![line.to_string()]);
        assert_eq!(lines.finish().unwrap(), None);
    }

    #[test]
    fn unterminated_tail_is_returned_on_finish() {
        let mut lines = SseLines::default();
        assert!(lines.push("data: [DO".as_bytes()).unwrap().is_empty());
        assert!(lines.push("NE]".as_bytes()).unwrap().is_empty());
        assert_eq!(lines.finish().unwrap().as_deref(), Some("data: [DONE]"));

        let mut lines = SseLines::default();
        assert!(lines.push(&[0xff, b'\n']).is_err());
    }

    /// Serves one canned streaming response, writing `parts` with a pause between each.
    async fn serve_stream(parts: Vec<Vec<u8>>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }

            socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
                )
                .await
                .unwrap();
            for part in parts {
                socket.write_all(&part).await.unwrap();
                socket.flush().await.unwrap();
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            }
            socket.shutdown().await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn streaming_survives_codepoints_split_between_reads() {
        let body = "data: {\"choices\":[{\"delta\":{\"content\":\"café\"}}]}\n\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\" €\"}}]}\n\n\
                    data: [DONE]\n\n";
        let bytes = body.as_bytes();
        let first_split = body.find('é').unwrap() + 1;
        let second_split = body.find('€').unwrap() + 2;
        let endpoint = serve_stream(vec![
            bytes[..first_split].to_vec(),
            bytes[first_split..second_split].to_vec(),
            bytes[second_split..].to_vec(),
        ])
        .await;

        let client = OpenAIClient::from_config(&ModelConfig {
            provider: ModelProvider::OpenAi,
            api_key: Some("test-key".into()),
            endpoint: Some(endpoint),
            max_retries: 0,
            ..ModelConfig::default()
        })
        .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let completion = client
            .complete_chat_streaming(&[Message::user("price in euros")], &[], &tx)
            .await
            .unwrap();
        drop(tx);

        assert_eq!(completion.content.as_deref(), Some("café €"));
        assert!(completion.tool_calls.is_empty());
        let mut streamed = String::new();
        while let Some(delta) = rx.recv().await {
            streamed.push_str(&delta);
        }
        assert_eq!(streamed, "café €");
    }

    #[test]
    fn builds_azure_deployment_url() {
        let client = OpenAIClient::from_config(&azure_config()).unwrap();
        assert_eq!(
            client.url,
            "https://example.openai.azure.com/openai/deployments/gpt-4o/chat/completions?api-version=2024-06-01"
        );
        assert_eq!(client.auth.0, "api-key");
    }

    #[test]
    fn encodes_tool_calls_and_results() {
        let messages = vec![
            Message::user("Chart MSFT RSI"),
            Message::assistant_with_tool_calls(
                "",
                vec![ToolCall::new(
                    "call_a",
                    "get_stock_technical_indicators",
                    json!({"ticker": "MSFT"}),
                )],
            ),
            Message::tool_result("call_a", "get_stock_technical_indicators", "{\"rsi\": 61}"),
        ];
        let wire = serde_json::to_value(OpenAIClient::to_openai_messages(&messages)).unwrap();
        assert_eq!(wire[1]["content"], Value::Null);
        assert_eq!(wire[1]["tool_calls"][0]["function"]["arguments"], "{\"ticker\":\"MSFT\"}");
        assert_eq!(wire[2]["role"], "tool");
        assert_eq!(wire[2]["tool_call_id"], "call_a");
        assert!(wire[2].get("name").is_none());
    }

    #[test]
    fn fills_missing_call_ids() {
        let completion = OpenAIClient::completion_from(OpenAiChoiceMessage {
            content: None,
            tool_calls: Some(vec![OpenAiToolCall {
                id: String::new(),
                r#type: "function".into(),
                function: OpenAiFunctionCall {
                    name: "get_weather".into(),
                    arguments: "{\"location\":\"Seattle, WA, US\"}".into(),
                },
            }]),
        });
        assert!(completion.tool_calls[0].id.starts_with("call_"));
        assert_eq!(completion.tool_calls[0].arguments["location"], "Seattle, WA, US");
    }

    #[tokio::test]
    async fn stub_model_scripts_directives() {
        let model = StubModel::new(vec![
            r#"{"action":"call_tools","calls":[{"name":"a"},{"name":"b","id":"x"}]}"#.into(),
            "plain text".into(),
            r#"{"action":"choose","label":"FINISH"}"#.into(),
        ]);
        let first = model.complete_chat(&[], &[]).await.unwrap();
        let ids: Vec<&str> = first.tool_calls.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["call_0", "x"]);

        let second = model.complete_chat(&[], &[]).await.unwrap();
        assert_eq!(second.content.as_deref(), Some("plain text"));

        let label = model.complete_choice(&[], &[]).await.unwrap();
        assert_eq!(label, "FINISH");
        assert_eq!(model.chat_calls(), 2);
        assert_eq!(model.choice_calls(), 1);
        assert!(model.complete_chat(&[], &[]).await.is_err());
    }
}
