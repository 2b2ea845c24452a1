//! Runtime configuration schema.
//!
//! One struct per concern, all with serde defaults so a partial TOML file
//! (or none at all) yields a working configuration. Unknown fields are
//! ignored for forward compatibility.

use serde::{Deserialize, Serialize};

/// Root configuration for a quorumcode process.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RuntimeConfig {
    /// Context engine sizing, thresholds, and externalization.
    #[serde(default)]
    pub context: ContextEngineConfig,

    /// Autonomous-mode guardrails.
    #[serde(default)]
    pub autonomous: crate::autonomous::AutonomousSettings,

    /// Registry endpoint and liveness parameters.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Exhaustion predictor tuning.
    #[serde(default)]
    pub exhaustion: ExhaustionConfig,

    /// Observability sinks (time travel, metrics).
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Context engine knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextEngineConfig {
    /// Token count the curator trims toward.
    #[serde(default = "default_target_context_size")]
    pub target_context_size: u64,

    /// Token count above which curation is triggered.
    #[serde(default = "default_optimal_context_size")]
    pub optimal_context_size: u64,

    /// Absolute context window capacity.
    #[serde(default = "default_context_window_max")]
    pub context_window_max: u64,

    /// Composite quality below this also triggers curation.
    #[serde(default = "default_quality_threshold")]
    pub quality_threshold: f64,

    /// Tool payloads longer than this are truncated (full payload is
    /// externalized).
    #[serde(default = "default_max_tool_payload_chars")]
    pub max_tool_payload_chars: usize,

    /// Target token count for the heuristic reducer.
    #[serde(default = "default_reducer_target_tokens")]
    pub reducer_target_tokens: u64,

    /// Whether externalized segments are written to disk.
    #[serde(default = "default_true")]
    pub externalize_write_enabled: bool,

    /// Directory for externalized segment files.
    #[serde(default = "default_external_memory_path")]
    pub external_memory_path: String,

    /// Context reset: enabled flag.
    #[serde(default = "default_true")]
    pub context_reset_enabled: bool,

    /// Context reset: archive root directory.
    #[serde(default = "default_context_reset_root")]
    pub context_reset_root: String,

    /// Context reset: trigger threshold in tokens.
    #[serde(default = "default_context_reset_trigger_tokens")]
    pub context_reset_trigger_tokens: u64,

    /// Context reset: user/assistant turn pairs to keep.
    #[serde(default = "default_context_reset_keep_turns")]
    pub context_reset_keep_turns: usize,

    /// Context reset: minimum user turns before a reset may fire.
    #[serde(default = "default_context_reset_min_user_turns")]
    pub context_reset_min_user_turns: usize,

    /// Segments older than this many seconds are pruned post-process.
    #[serde(default = "default_stale_segment_max_age_secs")]
    pub stale_segment_max_age_secs: u64,
}

impl Default for ContextEngineConfig {
    fn default() -> Self {
        Self {
            target_context_size: default_target_context_size(),
            optimal_context_size: default_optimal_context_size(),
            context_window_max: default_context_window_max(),
            quality_threshold: default_quality_threshold(),
            max_tool_payload_chars: default_max_tool_payload_chars(),
            reducer_target_tokens: default_reducer_target_tokens(),
            externalize_write_enabled: default_true(),
            external_memory_path: default_external_memory_path(),
            context_reset_enabled: default_true(),
            context_reset_root: default_context_reset_root(),
            context_reset_trigger_tokens: default_context_reset_trigger_tokens(),
            context_reset_keep_turns: default_context_reset_keep_turns(),
            context_reset_min_user_turns: default_context_reset_min_user_turns(),
            stale_segment_max_age_secs: default_stale_segment_max_age_secs(),
        }
    }
}

fn default_target_context_size() -> u64 {
    60_000
}

fn default_optimal_context_size() -> u64 {
    80_000
}

fn default_context_window_max() -> u64 {
    120_000
}

fn default_quality_threshold() -> f64 {
    0.45
}

fn default_max_tool_payload_chars() -> usize {
    16_384
}

fn default_reducer_target_tokens() -> u64 {
    256
}

fn default_true() -> bool {
    true
}

fn default_external_memory_path() -> String {
    "./external_memory".to_string()
}

fn default_context_reset_root() -> String {
    "./context_resets".to_string()
}

fn default_context_reset_trigger_tokens() -> u64 {
    100_000
}

fn default_context_reset_keep_turns() -> usize {
    3
}

fn default_context_reset_min_user_turns() -> usize {
    2
}

fn default_stale_segment_max_age_secs() -> u64 {
    7 * 24 * 3600
}

/// Registry endpoint and liveness parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Base URL of the registry HTTP surface.
    #[serde(default = "default_registry_base_url")]
    pub base_url: String,

    /// Seconds without a heartbeat before an agent is effectively
    /// unhealthy.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Seconds a starting process keeps retrying registration before the
    /// failure is fatal.
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    /// Seconds between background heartbeats.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            base_url: default_registry_base_url(),
            agent_timeout_secs: default_agent_timeout_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

fn default_registry_base_url() -> String {
    "http://127.0.0.1:9410".to_string()
}

fn default_agent_timeout_secs() -> u64 {
    90
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_heartbeat_interval_secs() -> u64 {
    20
}

/// Exhaustion predictor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExhaustionConfig {
    /// Probability at or above which the predictor preempts.
    #[serde(default = "default_exhaustion_threshold")]
    pub threshold: f64,
}

impl Default for ExhaustionConfig {
    fn default() -> Self {
        Self {
            threshold: default_exhaustion_threshold(),
        }
    }
}

fn default_exhaustion_threshold() -> f64 {
    0.65
}

/// Observability sinks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Directory for per-thread time-travel JSONL logs.
    #[serde(default = "default_time_travel_dir")]
    pub time_travel_dir: String,

    /// Whether metric events are emitted at all.
    #[serde(default = "default_true")]
    pub metrics_enabled: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            time_travel_dir: default_time_travel_dir(),
            metrics_enabled: default_true(),
        }
    }
}

fn default_time_travel_dir() -> String {
    "./time_travel_logs".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.context.context_window_max, 120_000);
        assert_eq!(config.registry.heartbeat_interval_secs, 20);
        assert!(config.context.externalize_write_enabled);
        assert!((config.exhaustion.threshold - 0.65).abs() < f64::EPSILON);
    }

    #[test]
    fn partial_override_keeps_other_defaults() {
        let config: RuntimeConfig = serde_json::from_str(
            r#"{"context": {"context_window_max": 500, "quality_threshold": 0.9}}"#,
        )
        .unwrap();
        assert_eq!(config.context.context_window_max, 500);
        assert!((config.context.quality_threshold - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.context.target_context_size, 60_000);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"registry": {"base_url": "http://r:1", "zzz": 1}}"#).unwrap();
        assert_eq!(config.registry.base_url, "http://r:1");
    }
}
