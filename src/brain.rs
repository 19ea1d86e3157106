use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::tools::tool_schema;
use crate::types::{Message, Role, ToolArguments, ToolCall, ToolName};

pub const DEFAULT_MODEL: &str = "gpt-4o";
pub const DEFAULT_API_URL: &str = "https://api.openai.com/v1";

pub const SYSTEM_PROMPT: &str = r#"You are a web extraction assistant. Your goal is to extract requested data from [HTML]. If the data is not available, use the tools to interact with the page. Please be thorough. Don't hesitate to drill down to subpages and extract data from them. If the page has a hamburger menu, you can click on it to open the menu and see the subpages.

Rules:
1. Request at most ONE tool call per response. Only the first one is executed.
2. Always explain in `reasoning` what you are doing and why.
3. If a tool result starts with "Error:", the action failed. Try a different selector or approach.
4. When you have the requested data, answer in plain text without calling any tool.

Approach it step by step."#;

/// What the model answered in one turn.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct AssistantReply {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

/// The language model behind the turn loop.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Send the (already pruned) conversation plus the tool schema and
    /// return the single assistant message.
    async fn complete(&self, messages: &[Message]) -> Result<AssistantReply>;
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub api_url: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            model: DEFAULT_MODEL.to_string(),
            temperature: Some(0.2),
        }
    }
}

/// OpenAI-compatible chat completions client with function calling.
pub struct Brain {
    client: Client,
    config: ModelConfig,
    tools: Value,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    tools: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: WireMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireMessage {
    role: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

fn function_kind() -> String {
    "function".to_string()
}

impl Brain {
    pub fn new(config: ModelConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            bail!("OPENAI_API_KEY not set in environment");
        }
        Ok(Self {
            client: Client::new(),
            config,
            tools: tool_schema(),
        })
    }
}

#[async_trait]
impl ModelService for Brain {
    async fn complete(&self, messages: &[Message]) -> Result<AssistantReply> {
        let url = format!("{}/chat/completions", self.config.api_url.trim_end_matches('/'));
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: messages.iter().map(to_wire).collect::<Result<_>>()?,
            tools: &self.tools,
            temperature: self.config.temperature,
        };

        tracing::debug!(model = %self.config.model, messages = messages.len(), "requesting completion");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.api_key)
            .json(&request)
            .send()
            .await
            .context("Failed to send model request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            bail!("Model API returned error {status}: {body}");
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse model response")?;

        let message = completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message)
            .ok_or_else(|| anyhow!("No choices in model response"))?;

        parse_reply(message)
    }
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

fn to_wire(message: &Message) -> Result<WireMessage> {
    let tool_calls = message
        .tool_calls
        .iter()
        .map(|call| {
            Ok(WireToolCall {
                id: call.id.clone(),
                kind: function_kind(),
                function: WireFunction {
                    name: call.name.as_str().to_string(),
                    arguments: serde_json::to_string(&call.arguments)?,
                },
            })
        })
        .collect::<Result<Vec<_>>>()?;

    // Assistant turns that only call a tool carry null content on the wire.
    let content = if message.content.is_empty() && !tool_calls.is_empty() {
        None
    } else {
        Some(message.content.clone())
    };

    Ok(WireMessage {
        role: role_name(message.role).to_string(),
        content,
        tool_calls,
        tool_call_id: message.tool_call_id.clone(),
    })
}

fn parse_reply(message: WireMessage) -> Result<AssistantReply> {
    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|call| {
            let name = ToolName::parse(&call.function.name)
                .ok_or_else(|| anyhow!("Model requested unknown tool '{}'", call.function.name))?;
            let arguments: ToolArguments = serde_json::from_str(&call.function.arguments)
                .with_context(|| {
                    format!(
                        "Malformed arguments for tool '{}': {}",
                        call.function.name, call.function.arguments
                    )
                })?;
            Ok(ToolCall {
                id: call.id,
                name,
                arguments,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(AssistantReply {
        content: message.content.unwrap_or_default(),
        tool_calls,
    })
}
