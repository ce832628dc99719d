//! Memory merge engine
//!
//! Folds one chunk's [`ChunkInsights`] into the cumulative [`Profile`]:
//!
//! | Field | Rule |
//! |-------|------|
//! | list fields | append, dedup by normalized text, keep the newest `max_list_items` |
//! | `workflow_patterns` | match on normalized `pattern`; `frequency += 1`, URLs unioned |
//! | `last_history_timestamp` | `max(existing, latest visit in chunk)` |
//! | `summary` | replaced by the latest non-empty summary |
//!
//! The watermark is order-independent; summary and pattern frequency are not.

use crate::types::{ChunkResult, Profile, WorkflowPattern};

pub const DEFAULT_MAX_LIST_ITEMS: usize = 50;
pub const MAX_WORKFLOW_PATTERNS: usize = 30;
pub const MAX_PATTERN_URLS: usize = 20;

/// Bounds applied while merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeLimits {
    pub max_list_items: usize,
    pub max_patterns: usize,
    pub max_pattern_urls: usize,
}

impl Default for MergeLimits {
    fn default() -> Self {
        Self {
            max_list_items: DEFAULT_MAX_LIST_ITEMS,
            max_patterns: MAX_WORKFLOW_PATTERNS,
            max_pattern_urls: MAX_PATTERN_URLS,
        }
    }
}

impl MergeLimits {
    pub fn with_max_list_items(max_list_items: usize) -> Self {
        Self {
            max_list_items,
            ..Default::default()
        }
    }
}

/// Merge with default limits.
pub fn merge(profile: Profile, result: &ChunkResult) -> Profile {
    merge_with(profile, result, &MergeLimits::default())
}

pub fn merge_with(mut profile: Profile, result: &ChunkResult, limits: &MergeLimits) -> Profile {
    let insights = &result.insights;
    let cap = limits.max_list_items;

    merge_list(&mut profile.goals, &insights.goals, cap);
    merge_list(&mut profile.obsessions, &insights.obsessions, cap);
    merge_list(&mut profile.preferences, &insights.preferences, cap);
    merge_list(&mut profile.traits, &insights.traits, cap);
    merge_list(&mut profile.interests, &insights.interests, cap);
    merge_list(&mut profile.technology_use, &insights.technology_use, cap);
    merge_list(&mut profile.lifecycle_hints, &insights.lifecycle_hints, cap);

    for incoming in &insights.workflow_patterns {
        merge_pattern(&mut profile.workflow_patterns, incoming, limits);
    }

    profile.last_history_timestamp = match (profile.last_history_timestamp, result.latest_visit) {
        (Some(existing), Some(latest)) => Some(existing.max(latest)),
        (existing, latest) => existing.or(latest),
    };

    if let Some(summary) = insights.summary.as_deref().map(str::trim) {
        if !summary.is_empty() {
            profile.summary = summary.to_string();
        }
    }

    profile
}

/// Normalize text for duplicate detection.
///
/// Lowercases, collapses whitespace and strips trailing punctuation, so
/// "Learning Rust." and "learning  rust" compare equal.
pub fn normalize(text: &str) -> String {
    let collapsed = text
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed
        .trim_end_matches(|c: char| c.is_ascii_punctuation())
        .to_string()
}

fn merge_list(existing: &mut Vec<String>, incoming: &[String], cap: usize) {
    for item in incoming {
        let trimmed = item.trim();
        let key = normalize(trimmed);
        if key.is_empty() {
            continue;
        }
        if existing.iter().any(|e| normalize(e) == key) {
            continue;
        }
        existing.push(trimmed.to_string());
    }
    // oldest first out
    if existing.len() > cap {
        let excess = existing.len() - cap;
        existing.drain(..excess);
    }
}

fn merge_pattern(patterns: &mut Vec<WorkflowPattern>, incoming: &WorkflowPattern, limits: &MergeLimits) {
    let key = normalize(&incoming.pattern);
    if key.is_empty() {
        return;
    }

    if let Some(existing) = patterns.iter_mut().find(|p| normalize(&p.pattern) == key) {
        existing.frequency = existing.frequency.saturating_add(1);
        union_urls(&mut existing.urls, &incoming.urls, limits.max_pattern_urls);
        if existing.description.trim().is_empty() {
            existing.description = incoming.description.clone();
        }
        if existing.suggestion.trim().is_empty() {
            existing.suggestion = incoming.suggestion.clone();
        }
        if existing.time_pattern.is_none() {
            existing.time_pattern = incoming.time_pattern.clone();
        }
        return;
    }

    let mut fresh = incoming.clone();
    fresh.pattern = fresh.pattern.trim().to_string();
    fresh.frequency = fresh.frequency.max(1);
    fresh.urls.clear();
    union_urls(&mut fresh.urls, &incoming.urls, limits.max_pattern_urls);
    patterns.push(fresh);

    if patterns.len() > limits.max_patterns {
        let excess = patterns.len() - limits.max_patterns;
        patterns.drain(..excess);
    }
}

fn union_urls(existing: &mut Vec<String>, incoming: &[String], cap: usize) {
    for url in incoming {
        let url = url.trim();
        if url.is_empty() || existing.iter().any(|u| u == url) {
            continue;
        }
        existing.push(url.to_string());
    }
    if existing.len() > cap {
        let excess = existing.len() - cap;
        existing.drain(..excess);
    }
}
