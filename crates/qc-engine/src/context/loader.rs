//! Progressive context loading.
//!
//! Infers what context the next LLM call will need from the intent of
//! recent user turns, synthesizes the segments that fit the remaining
//! window budget, and queues the rest for prefetch. Loaded segments are
//! mirrored into working memory with a type→priority hierarchy.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde_json::Value;
use tracing::debug;
use walkdir::WalkDir;

use qc_types::config::ContextEngineConfig;

use crate::state::{estimate_tokens, ChatState, ContextSegment, PrefetchRequest};

/// Priority for loader-synthesized segments.
const LOADED_PRIORITY: u8 = 6;

/// Maximum files listed in a file-structure segment.
const FILE_LIST_LIMIT: usize = 40;

/// The loader.
pub struct ProgressiveLoader {
    config: ContextEngineConfig,
    /// Root scanned for file-structure context; `None` disables scanning.
    workspace_root: Option<PathBuf>,
}

fn estimated_tokens_for(context_type: &str) -> u64 {
    match context_type {
        "code_context" => 400,
        "file_structure" => 200,
        "test_suite" => 300,
        "stack_traces" => 350,
        "error_history" => 250,
        "skill_catalog" => 150,
        "architecture_notes" => 200,
        "code_search_results" => 120,
        _ => 200,
    }
}

impl ProgressiveLoader {
    pub fn new(config: ContextEngineConfig) -> Self {
        Self {
            config,
            workspace_root: None,
        }
    }

    /// Attach a workspace root for environment-backed segments.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = Some(root.into());
        self
    }

    /// Infer needed context types from recent user text.
    fn infer_needs(&self, recent_text: &str) -> Vec<String> {
        let lower = recent_text.to_lowercase();
        let mut needs: Vec<String> = Vec::new();
        let mut push = |need: &str| {
            if !needs.iter().any(|n| n == need) {
                needs.push(need.to_string());
            }
        };

        if ["implement", "build", "add ", "write the"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            push("code_context");
            push("file_structure");
            push("test_suite");
        }
        if ["error", "stack", "exception", "traceback", "panic"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            push("stack_traces");
            push("error_history");
        }
        if ["debug", "investigate", "diagnose"].iter().any(|kw| lower.contains(kw)) {
            push("skill_catalog");
        }
        if ["design", "proposal", "architecture"].iter().any(|kw| lower.contains(kw)) {
            push("architecture_notes");
        }
        if self.extract_identifier(recent_text).is_some() {
            push("code_search_results");
        }
        needs
    }

    /// First identifier-shaped token (CamelCase or long snake_case) in the
    /// text, used to seed a code search segment.
    fn extract_identifier(&self, text: &str) -> Option<String> {
        text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .find(|token| {
                let camel = token.len() >= 8
                    && token.chars().next().is_some_and(|c| c.is_uppercase())
                    && token.chars().skip(1).any(|c| c.is_uppercase())
                    && token.chars().any(|c| c.is_lowercase());
                let snake = token.len() >= 12 && token.contains('_');
                camel || snake
            })
            .map(str::to_string)
    }

    /// Run the loader against the state.
    pub fn prepare(&self, state: &mut ChatState) {
        let recent_text: String = state
            .messages
            .iter()
            .rev()
            .filter(|m| m.is_human())
            .take(3)
            .map(|m| m.content())
            .collect::<Vec<_>>()
            .join("\n");
        if recent_text.trim().is_empty() {
            return;
        }

        let needs = self.infer_needs(&recent_text);
        if needs.is_empty() {
            return;
        }

        let loaded_types: BTreeSet<String> = state
            .context_segments
            .iter()
            .map(|s| {
                s.segment_type
                    .strip_prefix("pointer:")
                    .unwrap_or(&s.segment_type)
                    .to_string()
            })
            .collect();

        let window_max = if state.context_window_max > 0 {
            state.context_window_max
        } else {
            self.config.context_window_max
        };

        for need in needs {
            if loaded_types.contains(&need) {
                continue;
            }
            let estimate = estimated_tokens_for(&need);
            if state.context_window_used + estimate > window_max {
                if !state.pending_context.iter().any(|p| p == &need) {
                    state.pending_context.push(need.clone());
                    state.prefetch_queue.push(PrefetchRequest {
                        context_type: need.clone(),
                        estimated_tokens: estimate,
                    });
                }
                debug!(context_type = %need, "context need deferred to prefetch queue");
                continue;
            }

            let content = self.synthesize(&need, &recent_text, state);
            if content.trim().is_empty() {
                continue;
            }
            let segment = ContextSegment::new(
                format!("loaded-{}-{}", need, state.context_segments.len() + 1),
                need.clone(),
                content,
                LOADED_PRIORITY,
                0,
            );
            let segment = ContextSegment {
                token_count: estimate_tokens(&segment.content).max(1),
                ..segment
            };
            state.context_window_used += segment.token_count;
            state
                .context_hierarchy
                .insert(need.clone(), segment.priority);
            state
                .working_memory
                .insert(segment.id.clone(), segment.clone());
            state.context_segments.push(segment);
        }

        state.recompute_window_used();
    }

    /// Build segment content for a context type from the environment and
    /// the state itself.
    fn synthesize(&self, context_type: &str, recent_text: &str, state: &ChatState) -> String {
        match context_type {
            "file_structure" => self.file_structure(),
            "code_context" => format!(
                "Working set for the current task.\nGoal: {}\nRecent request: {}",
                if state.task_goal.is_empty() {
                    "(not recorded)"
                } else {
                    &state.task_goal
                },
                first_line(recent_text),
            ),
            "test_suite" => match &state.last_test_suite_result {
                Some(result) => format!(
                    "Latest test suite outcome: {}",
                    result
                        .get("overall_status")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                ),
                None => "No test suite has been recorded for this chat yet.".to_string(),
            },
            "stack_traces" => "Most recent captured stack traces follow tool failures; \
                 consult error_history for the failure sequence."
                .to_string(),
            "error_history" => {
                let failures: Vec<String> = state
                    .prp_telemetry
                    .iter()
                    .rev()
                    .filter(|e| e.event.contains("fail"))
                    .take(5)
                    .map(|e| format!("- {} at {}", e.event, e.timestamp))
                    .collect();
                if failures.is_empty() {
                    "No failures recorded in this chat so far.".to_string()
                } else {
                    format!("Recent failure events:\n{}", failures.join("\n"))
                }
            }
            "skill_catalog" => "Available diagnostic skills: workspace shell, file read/write, \
                 test suite runner, property-test harness, refinement ledger."
                .to_string(),
            "architecture_notes" => format!(
                "Design context for: {}",
                first_line(recent_text)
            ),
            "code_search_results" => {
                let identifier = self
                    .extract_identifier(recent_text)
                    .unwrap_or_else(|| "unknown".to_string());
                format!(
                    "Search results for '{identifier}':\n{}",
                    self.search_identifier(&identifier)
                )
            }
            other => format!("Context of type {other} for: {}", first_line(recent_text)),
        }
    }

    fn file_structure(&self) -> String {
        let Some(root) = &self.workspace_root else {
            return "No workspace is attached; file layout unavailable.".to_string();
        };
        let mut lines = Vec::new();
        for entry in WalkDir::new(root)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .take(FILE_LIST_LIMIT)
        {
            if let Ok(relative) = entry.path().strip_prefix(root) {
                lines.push(format!("- {}", relative.display()));
            }
        }
        if lines.is_empty() {
            "Workspace is empty.".to_string()
        } else {
            format!("Workspace files:\n{}", lines.join("\n"))
        }
    }

    fn search_identifier(&self, identifier: &str) -> String {
        let Some(root) = &self.workspace_root else {
            return format!("'{identifier}' is not indexed; no workspace attached.");
        };
        let mut hits = Vec::new();
        for entry in WalkDir::new(root)
            .max_depth(3)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .take(200)
        {
            if let Ok(content) = std::fs::read_to_string(entry.path()) {
                for (number, line) in content.lines().enumerate() {
                    if line.contains(identifier) {
                        hits.push(format!(
                            "{}:{}: {}",
                            entry.path().display(),
                            number + 1,
                            line.trim()
                        ));
                        if hits.len() >= 10 {
                            break;
                        }
                    }
                }
            }
            if hits.len() >= 10 {
                break;
            }
        }
        if hits.is_empty() {
            format!("no occurrences of '{identifier}' in the attached workspace")
        } else {
            hits.join("\n")
        }
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ChatMessage;

    fn loader() -> ProgressiveLoader {
        ProgressiveLoader::new(ContextEngineConfig::default())
    }

    fn state_with_message(text: &str) -> ChatState {
        let mut state = ChatState::new("c1", ContextEngineConfig::default().context_window_max);
        state.messages.push(ChatMessage::human(text));
        state
    }

    #[test]
    fn implement_intent_loads_code_context() {
        let mut state = state_with_message("Please implement the API and add tests");
        loader().prepare(&mut state);

        let types: BTreeSet<&str> = state
            .context_segments
            .iter()
            .map(|s| s.segment_type.as_str())
            .collect();
        assert!(types.contains("code_context"));
        assert!(types.contains("file_structure"));
        assert!(types.contains("test_suite"));

        for segment in &state.context_segments {
            assert!(!segment.content.to_lowercase().contains("placeholder"));
            assert!(segment.token_count > 0);
        }
    }

    #[test]
    fn over_budget_needs_go_to_prefetch_queue() {
        let config = ContextEngineConfig {
            context_window_max: 1000,
            ..Default::default()
        };
        let mut state = ChatState::new("c1", 1000);
        state
            .messages
            .push(ChatMessage::human("We observed an error and need stack traces"));
        state.context_window_used = 900;

        ProgressiveLoader::new(config).prepare(&mut state);

        assert!(state
            .pending_context
            .iter()
            .any(|p| p == "stack_traces" || p == "error_history"));
        assert!(state
            .prefetch_queue
            .iter()
            .any(|r| r.context_type == "stack_traces" || r.context_type == "error_history"));
    }

    #[test]
    fn working_memory_and_hierarchy_track_loads() {
        let mut state = state_with_message("Design proposal please");
        loader().prepare(&mut state);

        assert!(!state.working_memory.is_empty());
        assert!(!state.context_hierarchy.is_empty());
        for segment in state.working_memory.values() {
            assert!(segment.token_count > 0);
        }
    }

    #[test]
    fn identifier_generates_search_segment() {
        let mut state =
            state_with_message("Investigate ProgressiveLoader implementation details");
        loader().prepare(&mut state);

        let search: Vec<&ContextSegment> = state
            .context_segments
            .iter()
            .filter(|s| s.segment_type == "code_search_results")
            .collect();
        assert!(!search.is_empty());
        assert!(search[0].content.contains("ProgressiveLoader"));
    }

    #[test]
    fn already_loaded_types_are_not_duplicated() {
        let mut state = state_with_message("implement the parser");
        loader().prepare(&mut state);
        let count_before = state.context_segments.len();

        state.messages.push(ChatMessage::human("implement the lexer too"));
        loader().prepare(&mut state);
        assert_eq!(state.context_segments.len(), count_before);
    }

    #[test]
    fn file_structure_lists_workspace_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.rs"), "fn main() {}").unwrap();
        std::fs::write(dir.path().join("lib.rs"), "pub fn lib() {}").unwrap();

        let loader = ProgressiveLoader::new(ContextEngineConfig::default())
            .with_workspace_root(dir.path());
        let mut state = state_with_message("implement the feature");
        loader.prepare(&mut state);

        let file_structure = state
            .context_segments
            .iter()
            .find(|s| s.segment_type == "file_structure")
            .unwrap();
        assert!(file_structure.content.contains("main.rs"));
        assert!(file_structure.content.contains("lib.rs"));
    }

    #[test]
    fn window_accounting_stays_consistent() {
        let mut state = state_with_message("implement everything with an error trace");
        loader().prepare(&mut state);
        let sum: u64 = state.context_segments.iter().map(|s| s.token_count).sum();
        assert_eq!(state.context_window_used, sum);
    }
}
