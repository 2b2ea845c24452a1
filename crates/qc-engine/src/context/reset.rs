//! Context reset.
//!
//! When the window grows past the reset trigger and the chat has enough
//! user turns, the full transcript is archived to durable storage, a
//! summary is produced, and the live transcript is cut down to the last
//! N user/assistant turn pairs plus two synthetic segments pointing at
//! the archive.

use std::fs;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use qc_types::config::ContextEngineConfig;
use qc_types::envelope::wire_timestamp;

use crate::state::{estimate_tokens, ChatMessage, ChatState, ContextSegment};

/// Pluggable transcript summarizer. The default is the heuristic below;
/// an LLM-backed implementation can be swapped in by the runtime.
pub trait TranscriptSummarizer: Send + Sync {
    /// Produce a summary and its token estimate for the given transcript.
    fn summarize(&self, messages: &[ChatMessage]) -> (String, u64);
}

/// Deterministic fallback summarizer: opening request, latest assistant
/// line, and traffic counts.
pub struct HeuristicSummarizer;

impl TranscriptSummarizer for HeuristicSummarizer {
    fn summarize(&self, messages: &[ChatMessage]) -> (String, u64) {
        let first_user = messages
            .iter()
            .find(|m| m.is_human())
            .map(|m| m.content().lines().next().unwrap_or_default().to_string())
            .unwrap_or_default();
        let last_assistant = messages
            .iter()
            .rev()
            .find(|m| m.is_ai())
            .map(|m| m.content().lines().next().unwrap_or_default().to_string())
            .unwrap_or_default();
        let user_turns = messages.iter().filter(|m| m.is_human()).count();
        let assistant_turns = messages.iter().filter(|m| m.is_ai()).count();

        let summary = format!(
            "Conversation summary:\n- Opening request: {first_user}\n- Latest assistant state: {last_assistant}\n- Traffic: {user_turns} user turns, {assistant_turns} assistant turns.",
        );
        let tokens = estimate_tokens(&summary);
        (summary, tokens)
    }
}

/// The reset stage.
pub struct ContextReset {
    config: ContextEngineConfig,
}

impl ContextReset {
    pub fn new(config: ContextEngineConfig) -> Self {
        Self { config }
    }

    fn should_reset(&self, state: &ChatState) -> bool {
        if !self.config.context_reset_enabled {
            return false;
        }
        if state.context_window_used <= self.config.context_reset_trigger_tokens {
            return false;
        }
        let user_turns = state.messages.iter().filter(|m| m.is_human()).count();
        user_turns >= self.config.context_reset_min_user_turns
    }

    /// Trim the transcript to the last `keep_turns` user/assistant pairs.
    fn trim_transcript(&self, messages: &[ChatMessage]) -> Vec<ChatMessage> {
        let keep_turns = self.config.context_reset_keep_turns;
        let mut kept: Vec<ChatMessage> = Vec::new();
        let mut user_turns = 0;
        for message in messages.iter().rev() {
            match message {
                ChatMessage::Human { .. } => {
                    kept.push(message.clone());
                    user_turns += 1;
                    if user_turns >= keep_turns {
                        break;
                    }
                }
                ChatMessage::Ai { .. } => kept.push(message.clone()),
                // System and tool turns are archived, not kept.
                _ => {}
            }
        }
        kept.reverse();
        kept
    }

    /// Run the reset if triggered. Returns whether a reset happened.
    pub fn maybe_reset(
        &self,
        state: &mut ChatState,
        summarizer: &dyn TranscriptSummarizer,
    ) -> qc_types::Result<bool> {
        if !self.should_reset(state) {
            return Ok(false);
        }

        let stamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
        let archive_dir: PathBuf = PathBuf::from(&self.config.context_reset_root)
            .join(&state.chat_id)
            .join(&stamp);
        fs::create_dir_all(&archive_dir)?;

        let history_path = archive_dir.join("history.json");
        fs::write(&history_path, serde_json::to_string_pretty(&state.messages)?)?;

        let (summary, summary_tokens) = summarizer.summarize(&state.messages);
        let archived_count = state.messages.len();

        let trimmed = self.trim_transcript(&state.messages);
        let trimmed_path = archive_dir.join("trimmed_history.json");
        fs::write(&trimmed_path, serde_json::to_string_pretty(&trimmed)?)?;

        let addendum = format!(
            "Earlier conversation history ({archived_count} messages) was archived to {}. \
             Consult the context_reset_summary segment for the distilled state.",
            history_path.display()
        );
        let system_prompt_path = archive_dir.join("system_prompt.txt");
        fs::write(&system_prompt_path, &addendum)?;

        state.messages = trimmed;
        // The transcript shrank; keep the ingestion watermark in range.
        state.ingested_message_count = state.messages.len();

        // Register the archive as restorable external memory.
        let short = Uuid::new_v4().simple().to_string();
        let reference_id = format!("ref-{}-history", &short[..8]);
        state
            .external_memory_index
            .insert(reference_id.clone(), history_path.display().to_string());

        let summary_segment = ContextSegment {
            token_count: summary_tokens.max(1),
            compression_eligible: false,
            ..ContextSegment::new(
                format!("reset-summary-{stamp}"),
                "context_reset_summary",
                summary,
                9,
                0,
            )
        };
        let history_note = format!(
            "Archived {archived_count} transcript messages; ref {reference_id}."
        );
        let history_segment = ContextSegment {
            token_count: estimate_tokens(&history_note).max(1),
            compression_eligible: false,
            restorable_reference: Some(reference_id.clone()),
            ..ContextSegment::new(
                format!("reset-history-{stamp}"),
                "context_reset_history",
                history_note,
                8,
                0,
            )
        };
        state.context_segments.push(summary_segment);
        state.context_segments.push(history_segment);
        state.recompute_window_used();

        state.context_reset_count += 1;
        state.system_prompt_addendum = Some(addendum);
        state.last_context_reset = Some(json!({
            "history_path": history_path.display().to_string(),
            "trimmed_history_path": trimmed_path.display().to_string(),
            "system_prompt_path": system_prompt_path.display().to_string(),
            "archived_messages": archived_count,
            "summary_tokens": summary_tokens,
            "reset_at": wire_timestamp(),
        }));
        state.push_metric(
            "context_reset",
            json!({
                "archived_messages": archived_count,
                "kept_messages": state.messages.len(),
                "reset_count": state.context_reset_count,
            }),
        );
        info!(
            chat_id = %state.chat_id,
            archived = archived_count,
            kept = state.messages.len(),
            "context reset performed"
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reset_config(root: &std::path::Path) -> ContextEngineConfig {
        ContextEngineConfig {
            context_reset_enabled: true,
            context_reset_root: root.to_string_lossy().to_string(),
            context_reset_trigger_tokens: 200,
            context_reset_keep_turns: 2,
            context_reset_min_user_turns: 1,
            ..Default::default()
        }
    }

    fn conversational_state() -> ChatState {
        let mut state = ChatState::new("c1", 1000);
        for turn in 1..=3 {
            state.messages.push(ChatMessage::human(format!(
                "User turn {turn} {}",
                "padding ".repeat(10)
            )));
            state.messages.push(ChatMessage::ai(format!(
                "Assistant reply {turn} {}",
                "padding ".repeat(10)
            )));
        }
        state
            .context_segments
            .push(ContextSegment::new("seg-1", "tool_output", "artifact", 6, 250));
        state.recompute_window_used();
        state
    }

    #[test]
    fn reset_archives_and_trims() {
        let dir = tempfile::tempdir().unwrap();
        let reset = ContextReset::new(reset_config(dir.path()));
        let mut state = conversational_state();

        let fired = reset.maybe_reset(&mut state, &HeuristicSummarizer).unwrap();
        assert!(fired);
        assert_eq!(state.context_reset_count, 1);

        // Exactly keep_turns user/assistant pairs remain.
        assert_eq!(state.messages.len(), 4);

        let meta = state.last_context_reset.as_ref().unwrap();
        for key in ["history_path", "trimmed_history_path", "system_prompt_path"] {
            let path = meta[key].as_str().unwrap();
            assert!(std::path::Path::new(path).exists(), "{key} missing on disk");
        }

        let types: Vec<&str> = state
            .context_segments
            .iter()
            .map(|s| s.segment_type.as_str())
            .collect();
        assert!(types.contains(&"context_reset_summary"));
        assert!(types.contains(&"context_reset_history"));

        let addendum = state.system_prompt_addendum.as_ref().unwrap();
        assert!(addendum.to_lowercase().contains("history"));
    }

    #[test]
    fn history_segment_reference_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let reset = ContextReset::new(reset_config(dir.path()));
        let mut state = conversational_state();
        reset.maybe_reset(&mut state, &HeuristicSummarizer).unwrap();

        let history_segment = state
            .context_segments
            .iter()
            .find(|s| s.segment_type == "context_reset_history")
            .unwrap();
        let reference = history_segment.restorable_reference.as_ref().unwrap();
        let path = state.external_memory_index.get(reference).unwrap();
        assert!(std::path::Path::new(path).exists());
    }

    #[test]
    fn no_reset_below_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = reset_config(dir.path());
        config.context_reset_trigger_tokens = 10_000;
        let reset = ContextReset::new(config);
        let mut state = conversational_state();

        let fired = reset.maybe_reset(&mut state, &HeuristicSummarizer).unwrap();
        assert!(!fired);
        assert_eq!(state.context_reset_count, 0);
        assert_eq!(state.messages.len(), 6);
    }

    #[test]
    fn no_reset_with_too_few_user_turns() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = reset_config(dir.path());
        config.context_reset_min_user_turns = 10;
        let reset = ContextReset::new(config);
        let mut state = conversational_state();

        let fired = reset.maybe_reset(&mut state, &HeuristicSummarizer).unwrap();
        assert!(!fired);
    }

    #[test]
    fn disabled_reset_never_fires() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = reset_config(dir.path());
        config.context_reset_enabled = false;
        let reset = ContextReset::new(config);
        let mut state = conversational_state();

        assert!(!reset.maybe_reset(&mut state, &HeuristicSummarizer).unwrap());
    }

    #[test]
    fn summarizer_mentions_traffic() {
        let state = conversational_state();
        let (summary, tokens) = HeuristicSummarizer.summarize(&state.messages);
        assert!(summary.contains("3 user turns"));
        assert!(tokens > 0);
    }
}
