//! LLM driver contract and prompt assembly.
//!
//! The model is an external collaborator: a tool-capable chat completion
//! behind the [`ChatModel`] trait. The driver's own contribution is the
//! prompt: base system prompt, any reset addendum, context segments in
//! governor-outline order (plus unlisted high-priority segments), then
//! the conversational messages.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;

use qc_engine::state::{ChatState, ChatMessage, ToolCall};
use qc_types::Result;

/// Priority at or above which a segment is appended even when the
/// governor outline does not list it.
const UNLISTED_PRIORITY_FLOOR: u8 = 8;

/// JSON schema advertisement for one tool.
#[derive(Debug, Clone)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A fully assembled model request.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSchema>,
}

/// The model's reply: text and/or tool calls.
#[derive(Debug, Clone, Default)]
pub struct ModelResponse {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            tool_calls: Vec::new(),
        }
    }

    pub fn tool_call(name: &str, arguments: Value) -> Self {
        Self {
            content: String::new(),
            tool_calls: vec![ToolCall {
                id: format!("call-{name}"),
                name: name.to_string(),
                arguments,
            }],
        }
    }

    /// An empty reply: no text, no tool calls. Classified as an LLM stop.
    pub fn is_empty(&self) -> bool {
        self.content.trim().is_empty() && self.tool_calls.is_empty()
    }
}

/// A tool-capable chat completion.
#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Execute one completion against the bound tools.
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse>;
}

/// Assemble the system prompt for the next call.
pub fn assemble_system_prompt(base: &str, state: &ChatState) -> String {
    let mut prompt = String::from(base);

    if let Some(addendum) = &state.system_prompt_addendum {
        prompt.push_str("\n\n");
        prompt.push_str(addendum);
    }

    let ordered: Vec<String> = state
        .governor_prompt_outline
        .as_ref()
        .and_then(|outline| outline.get("ordered_segments"))
        .and_then(Value::as_array)
        .map(|ids| {
            ids.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    let mut rendered: Vec<&str> = Vec::new();
    let mut sections = String::new();

    for id in &ordered {
        if let Some(segment) = state.context_segments.iter().find(|s| &s.id == id) {
            sections.push_str(&format!(
                "\n\n[{}: {}]\n{}",
                segment.segment_type, segment.id, segment.content
            ));
            rendered.push(segment.id.as_str());
        }
    }
    for segment in &state.context_segments {
        if segment.priority >= UNLISTED_PRIORITY_FLOOR && !rendered.contains(&segment.id.as_str()) {
            sections.push_str(&format!(
                "\n\n[{}: {}]\n{}",
                segment.segment_type, segment.id, segment.content
            ));
        }
    }

    if !sections.is_empty() {
        prompt.push_str("\n\n## Working context");
        prompt.push_str(&sections);
    }
    prompt
}

/// Build the full request for a state.
pub fn build_request(base_prompt: &str, state: &ChatState, tools: Vec<ToolSchema>) -> ModelRequest {
    ModelRequest {
        system: assemble_system_prompt(base_prompt, state),
        messages: state.messages.clone(),
        tools,
    }
}

/// Scripted model for tests and dry runs: pops canned responses in order
/// and records every request it saw.
#[derive(Default)]
pub struct ScriptedModel {
    responses: Mutex<VecDeque<ModelResponse>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(responses: Vec<ModelResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Requests observed so far.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().expect("scripted model lock").clone()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        self.requests
            .lock()
            .expect("scripted model lock")
            .push(request.clone());
        Ok(self
            .responses
            .lock()
            .expect("scripted model lock")
            .pop_front()
            .unwrap_or_default())
    }
}
