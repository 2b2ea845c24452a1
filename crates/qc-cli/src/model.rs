//! Development model binding.
//!
//! The real LLM is an external service bound at deployment time; this
//! loopback implementation keeps the binary runnable without one. It
//! answers with a short acknowledgement of the latest human turn and
//! never calls tools.

use async_trait::async_trait;

use qc_runtime::driver::{ChatModel, ModelRequest, ModelResponse};
use qc_types::Result;

/// Echo-style stand-in for a chat completion service.
#[derive(Default)]
pub struct LoopbackModel;

#[async_trait]
impl ChatModel for LoopbackModel {
    async fn complete(&self, request: &ModelRequest) -> Result<ModelResponse> {
        let last_human = request
            .messages
            .iter()
            .rev()
            .find(|m| m.is_human())
            .map(|m| m.content().to_string())
            .unwrap_or_default();
        if last_human.is_empty() {
            return Ok(ModelResponse::default());
        }
        Ok(ModelResponse::text(format!(
            "Acknowledged: {last_human}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_engine::state::ChatMessage;

    #[tokio::test]
    async fn loopback_echoes_last_human_turn() {
        let model = LoopbackModel;
        let request = ModelRequest {
            system: "s".into(),
            messages: vec![ChatMessage::human("run the tests")],
            tools: vec![],
        };
        let response = model.complete(&request).await.unwrap();
        assert!(response.content.contains("run the tests"));
    }

    #[tokio::test]
    async fn loopback_empty_without_human_turn() {
        let model = LoopbackModel;
        let request = ModelRequest {
            system: "s".into(),
            messages: vec![],
            tools: vec![],
        };
        assert!(model.complete(&request).await.unwrap().is_empty());
    }
}
