//! Heuristic content reducer.
//!
//! Used by compression and summarize actions: keeps the first and last
//! lines and a keyword bullet, targeting at most half the original token
//! footprint (or the configured reducer target, whichever is smaller).

use std::collections::BTreeMap;

use crate::state::estimate_tokens;

/// Reduce `content` to a summarized form.
pub fn reduce_content(content: &str, target_tokens: u64) -> String {
    let lines: Vec<&str> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    if lines.is_empty() {
        return String::new();
    }
    if lines.len() == 1 && estimate_tokens(lines[0]) <= target_tokens {
        return lines[0].to_string();
    }

    let first = lines.first().copied().unwrap_or_default();
    let last = lines.last().copied().unwrap_or_default();

    let mut reduced = String::new();
    reduced.push_str(first);
    let keywords = top_keywords(content, 5);
    if !keywords.is_empty() {
        reduced.push('\n');
        reduced.push_str("- key: ");
        reduced.push_str(&keywords.join(", "));
    }
    if last != first {
        reduced.push('\n');
        reduced.push_str(last);
    }

    // Hard-trim if the frame lines alone overshoot the target.
    if estimate_tokens(&reduced) > target_tokens {
        let words: Vec<&str> = reduced.split_whitespace().collect();
        let keep = (target_tokens as usize).max(8).min(words.len());
        reduced = words[..keep].join(" ");
    }
    reduced
}

/// Most frequent words longer than four characters, alphabetic tie-break.
fn top_keywords(content: &str, limit: usize) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for word in content
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 4)
    {
        *counts.entry(word.to_string()).or_default() += 1;
    }
    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(limit).map(|(word, _)| word).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_first_and_last_lines() {
        let content = "opening statement about the parser\nmiddle detail one\nmiddle detail two\nclosing conclusion about recovery";
        let reduced = reduce_content(content, 64);
        assert!(reduced.starts_with("opening statement"));
        assert!(reduced.contains("closing conclusion") || reduced.contains("recovery"));
    }

    #[test]
    fn reduction_shrinks_long_content() {
        let content = "header line\n".to_string() + &"repeated filler detail sentence here\n".repeat(60) + "footer line";
        let original = estimate_tokens(&content);
        let reduced = reduce_content(&content, original / 2);
        assert!(estimate_tokens(&reduced) <= original / 2);
    }

    #[test]
    fn keywords_surface_frequent_terms() {
        let content = "latency latency latency throughput throughput jitter\nmore text about latency";
        let reduced = reduce_content(content, 64);
        assert!(reduced.contains("latency"));
    }

    #[test]
    fn empty_content_reduces_to_empty() {
        assert_eq!(reduce_content("", 32), "");
        assert_eq!(reduce_content("\n\n  \n", 32), "");
    }
}
