//! Prompt construction and response parsing for chunk analysis.

use chrono::{DateTime, Local, Utc};
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::provider::{estimate_tokens, PromptOptions};
use crate::types::{Chunk, ChunkInsights, HistoryEntry, Profile, TimeRange};

pub const SYSTEM_PROMPT: &str = "You analyze a person's web browsing history to maintain a behavioral profile. Return strict JSON with string-array keys goals, obsessions, preferences, traits, interests, technology_use, lifecycle_hints, a short string field summary, and an array workflow_patterns of objects {pattern, description, frequency, urls, time_pattern, suggestion, automation_potential (high|medium|low)}. Only report what the history supports.";

const RANGE_SYSTEM_PROMPT: &str = "You segment browsing history into coherent activity periods. Return strict JSON {\"ranges\":[{\"start\":RFC3339,\"end\":RFC3339}]} with non-overlapping ranges in chronological order.";

/// Fixed cost of the instructions and framing around the history lines
const PROMPT_OVERHEAD_CHARS: usize = 1_200;
const MAX_TITLE_CHARS: usize = 160;
const MAX_URL_CHARS: usize = 240;
const MAX_CONTEXT_ITEMS: usize = 10;

/// Options used for every chunk analysis call.
pub fn chunk_prompt_options() -> PromptOptions {
    PromptOptions {
        system: Some(SYSTEM_PROMPT.to_string()),
        temperature: Some(0.0),
        max_output_tokens: None,
        json: true,
    }
}

/// One history line as it appears in a prompt.
pub fn format_entry(entry: &HistoryEntry) -> String {
    let when = entry
        .visited_at
        .map(|ts| ts.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let title = clip(entry.title.trim(), MAX_TITLE_CHARS);
    let url = clip(&entry.url, MAX_URL_CHARS);
    if title.is_empty() {
        format!("[{when}] {url} (visits: {})\n", entry.visit_count)
    } else {
        format!("[{when}] {title} | {url} (visits: {})\n", entry.visit_count)
    }
}

/// Estimated prompt tokens one entry contributes.
pub fn entry_tokens(entry: &HistoryEntry) -> usize {
    estimate_tokens(&format_entry(entry))
}

/// Build the analysis prompt for a chunk, keeping it within `max_chars`.
///
/// The current profile summary and top interests are included so the model
/// can refine rather than restate.
pub fn build_chunk_prompt(chunk: &Chunk, profile: &Profile, max_chars: usize) -> String {
    let mut context = String::new();
    if !profile.summary.is_empty() {
        context.push_str(&format!("Current profile summary: {}\n", profile.summary));
    }
    if !profile.interests.is_empty() {
        let top: Vec<&str> = profile
            .interests
            .iter()
            .rev()
            .take(MAX_CONTEXT_ITEMS)
            .map(String::as_str)
            .collect();
        context.push_str(&format!("Known interests: {}\n", top.join(", ")));
    }

    let header = format!(
        "Browsing period {} to {} (part {} of {}).\n{}\nHistory:\n",
        chunk.start.to_rfc3339(),
        chunk.end.to_rfc3339(),
        chunk.index + 1,
        chunk.total_chunks,
        context
    );
    let footer = "\nReturn only JSON.";

    let budget = max_chars
        .saturating_sub(header.len() + footer.len() + PROMPT_OVERHEAD_CHARS)
        .max(1);
    let mut lines = String::new();
    let mut omitted = 0usize;
    for entry in &chunk.items {
        let line = format_entry(entry);
        if lines.len() + line.len() > budget {
            omitted += 1;
            continue;
        }
        lines.push_str(&line);
    }
    if omitted > 0 {
        tracing::debug!(omitted, chunk = chunk.index, "Prompt truncated to fit input budget");
        lines.push_str(&format!("...[{omitted} more entries truncated]\n"));
    }

    format!("{header}{lines}{footer}")
}

/// Parse a model response into chunk insights.
///
/// Accepts bare JSON or JSON embedded in prose/code fences.
pub fn parse_insights(raw: &str) -> Result<ChunkInsights> {
    let value = parse_json_object(raw)?;
    let insights: ChunkInsights = serde_json::from_value(value)?;
    Ok(insights)
}

/// Prompt asking the model to segment entries into activity ranges.
pub fn build_range_prompt(items: &[HistoryEntry], max_chars: usize) -> (String, PromptOptions) {
    let mut lines = String::new();
    for entry in items {
        let Some(ts) = entry.visited_at else {
            continue;
        };
        let line = format!("{} {}\n", ts.to_rfc3339(), clip(entry.title.trim(), 80));
        if lines.len() + line.len() > max_chars {
            break;
        }
        lines.push_str(&line);
    }
    let prompt = format!("Visits (UTC):\n{lines}\nReturn only JSON.");
    let opts = PromptOptions {
        system: Some(RANGE_SYSTEM_PROMPT.to_string()),
        temperature: Some(0.0),
        max_output_tokens: Some(800),
        json: true,
    };
    (prompt, opts)
}

#[derive(Deserialize)]
struct RangeResponse {
    #[serde(default)]
    ranges: Vec<RawRange>,
}

#[derive(Deserialize)]
struct RawRange {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

/// Parse model-suggested ranges, discarding empty or inverted ones.
pub fn parse_time_ranges(raw: &str) -> Result<Vec<TimeRange>> {
    let value = parse_json_object(raw)?;
    let parsed: RangeResponse = serde_json::from_value(value)?;
    let mut ranges: Vec<TimeRange> = parsed
        .ranges
        .into_iter()
        .map(|r| TimeRange::new(r.start, r.end))
        .filter(|r| !r.is_empty())
        .collect();
    ranges.sort_by_key(|r| r.start);
    Ok(ranges)
}

fn parse_json_object(raw: &str) -> Result<serde_json::Value> {
    let parsed = match serde_json::from_str::<serde_json::Value>(raw) {
        Ok(value) => value,
        Err(_) => {
            let extracted = extract_json_object(raw)?;
            serde_json::from_str::<serde_json::Value>(&extracted)?
        }
    };

    if !parsed.is_object() {
        return Err(Error::Llm("model response must be a JSON object".to_string()));
    }

    Ok(parsed)
}

fn extract_json_object(raw: &str) -> Result<String> {
    let start = raw
        .find('{')
        .ok_or_else(|| Error::Llm("model response did not contain JSON object".to_string()))?;
    let end = raw
        .rfind('}')
        .ok_or_else(|| Error::Llm("model response did not contain JSON object".to_string()))?;
    if end <= start {
        return Err(Error::Llm("model response JSON bounds are invalid".to_string()));
    }
    Ok(raw[start..=end].to_string())
}

fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AutomationPotential;
    use chrono::TimeZone;

    fn sample_chunk(n: usize) -> Chunk {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let items = (0..n)
            .map(|i| {
                HistoryEntry::new(
                    format!("https://example.com/page/{i}"),
                    format!("Example page {i}"),
                    base + chrono::Duration::minutes(i as i64),
                )
            })
            .collect();
        Chunk {
            items,
            start: base,
            end: base + chrono::Duration::hours(3),
            index: 0,
            total_chunks: 1,
            is_fallback: true,
        }
    }

    #[test]
    fn test_parse_insights_accepts_embedded_json() {
        let raw = "Here you go:\n```json\n{\"summary\":\"Learns Rust\",\"interests\":[\"rust\"],\"workflow_patterns\":[{\"pattern\":\"docs lookup\",\"automation_potential\":\"high\"}]}\n```";
        let insights = parse_insights(raw).expect("embedded JSON should parse");
        assert_eq!(insights.summary.as_deref(), Some("Learns Rust"));
        assert_eq!(insights.interests, vec!["rust"]);
        assert_eq!(
            insights.workflow_patterns[0].automation_potential,
            AutomationPotential::High
        );
        assert!(insights.goals.is_empty());
    }

    #[test]
    fn test_parse_insights_rejects_non_object() {
        assert!(matches!(parse_insights("[1,2,3]"), Err(Error::Llm(_))));
        assert!(parse_insights("no json here").is_err());
    }

    #[test]
    fn test_prompt_includes_entries_and_context() {
        let profile = Profile {
            summary: "Enjoys cooking".to_string(),
            interests: vec!["sourdough".to_string()],
            ..Default::default()
        };
        let prompt = build_chunk_prompt(&sample_chunk(3), &profile, 100_000);
        assert!(prompt.contains("Example page 2"));
        assert!(prompt.contains("Enjoys cooking"));
        assert!(prompt.contains("sourdough"));
        assert!(prompt.contains("part 1 of 1"));
        assert!(!prompt.contains("truncated"));
    }

    #[test]
    fn test_prompt_truncates_to_budget() {
        let prompt = build_chunk_prompt(&sample_chunk(500), &Profile::default(), 4_000);
        assert!(prompt.contains("more entries truncated"));
        assert!(prompt.len() < 4_000);
    }

    #[test]
    fn test_parse_time_ranges_sorts_and_filters() {
        let raw = r#"{"ranges":[
            {"start":"2024-03-01T13:00:00Z","end":"2024-03-01T15:00:00Z"},
            {"start":"2024-03-01T09:00:00Z","end":"2024-03-01T11:00:00Z"},
            {"start":"2024-03-01T12:00:00Z","end":"2024-03-01T12:00:00Z"}
        ]}"#;
        let ranges = parse_time_ranges(raw).unwrap();
        assert_eq!(ranges.len(), 2);
        assert!(ranges[0].start < ranges[1].start);
    }

    #[test]
    fn test_format_entry_without_title() {
        let mut entry = HistoryEntry::new("https://a.example", "", Utc::now());
        entry.visit_count = 4;
        let line = format_entry(&entry);
        assert!(line.contains("https://a.example (visits: 4)"));
        assert!(entry_tokens(&entry) > 0);
    }
}
