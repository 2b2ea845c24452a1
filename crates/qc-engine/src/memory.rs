//! Long-term memory distilled from the refinement ledger.
//!
//! Concluded cycles become episodic entries; per-strategy success and
//! failure counts consolidate into semantic patterns; guidance surfaces
//! the strongest patterns as recommendations with the cycles that back
//! them.

use serde_json::json;

use qc_types::envelope::wire_timestamp;

use crate::state::{ChatState, Episode, LedgerEntry, LedgerStatus, MemoryGuidance, StrategyPattern};

/// Record an episode for a ledger row and consolidate its strategy
/// pattern.
pub fn record_episode_from_ledger(state: &mut ChatState, entry: &LedgerEntry) {
    state.episodic_memory.push(Episode {
        cycle_id: entry.cycle_id.clone(),
        hypothesis: entry.hypothesis.clone(),
        status: entry.status,
        strategy: entry.strategy.clone(),
        exhaustion_trigger: entry.exhaustion_trigger,
        outcome_summary: entry.outcome_summary.clone(),
        recorded_at: wire_timestamp(),
    });

    let strategy = entry
        .strategy
        .clone()
        .unwrap_or_else(|| "unspecified".to_string());
    let pattern = state
        .semantic_memory
        .entry(strategy)
        .or_insert_with(StrategyPattern::default);
    match entry.status {
        LedgerStatus::Succeeded => pattern.successes += 1,
        LedgerStatus::Failed | LedgerStatus::Abandoned => pattern.failures += 1,
        _ => {}
    }
    if !pattern.supporting_cycles.iter().any(|c| c == &entry.cycle_id) {
        pattern.supporting_cycles.push(entry.cycle_id.clone());
    }

    state.push_telemetry(
        "memory_episode_recorded",
        json!({ "cycle_id": entry.cycle_id, "status": entry.status.as_str() }),
    );
}

/// Regenerate memory guidance from the consolidated patterns.
///
/// Patterns with at least one concluded outcome are ranked by success
/// rate; the top performers become "prefer" recommendations and the worst
/// become "avoid" warnings.
pub fn update_memory_guidance(state: &mut ChatState) -> Option<MemoryGuidance> {
    let mut ranked: Vec<(String, f64, Vec<String>)> = state
        .semantic_memory
        .iter()
        .filter(|(_, pattern)| pattern.successes + pattern.failures > 0)
        .map(|(strategy, pattern)| {
            (
                strategy.clone(),
                pattern.success_rate(),
                pattern.supporting_cycles.clone(),
            )
        })
        .collect();
    if ranked.is_empty() {
        return None;
    }
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut recommendations = Vec::new();
    let mut supporting_cycles = Vec::new();

    if let Some((strategy, rate, cycles)) = ranked.first() {
        if *rate >= 0.5 {
            recommendations.push(format!(
                "prefer strategy '{strategy}' (success rate {:.0}%)",
                rate * 100.0
            ));
            supporting_cycles.extend(cycles.iter().cloned());
        }
    }
    if let Some((strategy, rate, cycles)) = ranked.last() {
        if *rate < 0.5 {
            recommendations.push(format!(
                "avoid strategy '{strategy}' without changes (success rate {:.0}%)",
                rate * 100.0
            ));
            supporting_cycles.extend(cycles.iter().cloned());
        }
    }
    if recommendations.is_empty() {
        recommendations.push("no strategy has distinguished itself yet; keep varying".to_string());
        supporting_cycles.extend(ranked.iter().flat_map(|(_, _, c)| c.iter().cloned()));
    }

    supporting_cycles.sort();
    supporting_cycles.dedup();

    let guidance = MemoryGuidance {
        recommendations,
        supporting_cycles,
        generated_at: wire_timestamp(),
    };
    state.memory_guidance = Some(guidance.clone());
    Some(guidance)
}

#[cfg(test)]
mod tests {
    use super::*;
    use qc_types::exhaustion::ExhaustionMode;

    fn entry(cycle_id: &str, status: LedgerStatus, strategy: &str) -> LedgerEntry {
        let mut entry = LedgerEntry::new(cycle_id, format!("Hypothesis {cycle_id}"));
        entry.status = status;
        entry.strategy = Some(strategy.to_string());
        entry.outcome_summary = format!("Outcome for {cycle_id}");
        entry.exhaustion_trigger = if status == LedgerStatus::Failed {
            ExhaustionMode::TestFailure
        } else {
            ExhaustionMode::None
        };
        entry
    }

    #[test]
    fn episodes_and_patterns_accumulate() {
        let mut state = ChatState::new("c1", 1024);
        for e in [
            entry("cycle-2", LedgerStatus::Succeeded, "refactor"),
            entry("cycle-3", LedgerStatus::Failed, "refactor"),
            entry("cycle-4", LedgerStatus::Succeeded, "refactor"),
        ] {
            record_episode_from_ledger(&mut state, &e);
        }

        assert_eq!(state.episodic_memory.len(), 3);
        let pattern = state.semantic_memory.get("refactor").unwrap();
        assert_eq!(pattern.successes, 2);
        assert_eq!(pattern.failures, 1);
        assert_eq!(pattern.supporting_cycles.len(), 3);

        let guidance = update_memory_guidance(&mut state).unwrap();
        assert!(!guidance.recommendations.is_empty());
        assert!(!guidance.supporting_cycles.is_empty());
        assert!(guidance.recommendations[0].contains("refactor"));
    }

    #[test]
    fn losing_strategy_gets_an_avoid_warning() {
        let mut state = ChatState::new("c1", 1024);
        record_episode_from_ledger(&mut state, &entry("cycle-1", LedgerStatus::Succeeded, "good"));
        record_episode_from_ledger(&mut state, &entry("cycle-2", LedgerStatus::Failed, "bad"));
        record_episode_from_ledger(&mut state, &entry("cycle-3", LedgerStatus::Failed, "bad"));

        let guidance = update_memory_guidance(&mut state).unwrap();
        assert!(guidance
            .recommendations
            .iter()
            .any(|r| r.starts_with("prefer strategy 'good'")));
        assert!(guidance
            .recommendations
            .iter()
            .any(|r| r.starts_with("avoid strategy 'bad'")));
    }

    #[test]
    fn in_progress_entries_do_not_skew_patterns() {
        let mut state = ChatState::new("c1", 1024);
        record_episode_from_ledger(
            &mut state,
            &entry("cycle-1", LedgerStatus::InProgress, "pending"),
        );
        assert!(update_memory_guidance(&mut state).is_none());
    }
}
