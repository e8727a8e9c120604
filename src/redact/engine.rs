//! Tree traversal and string redaction. Per spec.md §4.4: non-mutating
//! (builds a fresh tree), path-scoped, with context-gated and global regex
//! rules.

use super::policy::CompiledPolicy;
use crate::replacement_map::ReplacementMap;
use serde_json::Value;
use std::collections::HashMap;

/// Per-request redaction counters, reset at the start of each request.
#[derive(Default, Debug)]
pub struct Stats {
    counts: HashMap<String, usize>,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, rule_id: &str) {
        *self.counts.entry(rule_id.to_string()).or_insert(0) += 1;
    }

    pub fn get(&self, rule_id: &str) -> usize {
        self.counts.get(rule_id).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Depth limit guarding against cyclic/pathological JSON from a buggy
/// upstream or plugin, per spec.md §9.
const MAX_DEPTH: usize = 64;

/// Redacts `value` against `policy`, returning a freshly built `Value`. In
/// reversible mode, `map` accumulates the original↔placeholder mapping; in
/// one-way mode, pass `None` and rule `replacement` text is used directly.
pub fn redact_value(
    value: &Value,
    policy: &CompiledPolicy,
    stats: &mut Stats,
    map: Option<&mut ReplacementMap>,
) -> Value {
    let mut path = Vec::new();
    redact_inner(value, policy, stats, &mut path, map, 0)
}

fn redact_inner(
    value: &Value,
    policy: &CompiledPolicy,
    stats: &mut Stats,
    path: &mut Vec<String>,
    mut map: Option<&mut ReplacementMap>,
    depth: usize,
) -> Value {
    if depth > MAX_DEPTH {
        return Value::String("[DEPTH_LIMIT_EXCEEDED]".to_string());
    }

    match value {
        Value::String(s) => {
            if policy.paths.allows(path) {
                Value::String(redact_string(s, policy, stats, map))
            } else {
                Value::String(s.clone())
            }
        }
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            path.push("*".to_string());
            for item in items {
                out.push(redact_inner(
                    item,
                    policy,
                    stats,
                    path,
                    map.as_deref_mut(),
                    depth + 1,
                ));
            }
            path.pop();
            Value::Array(out)
        }
        Value::Object(entries) => {
            let mut out = serde_json::Map::with_capacity(entries.len());
            for (key, val) in entries {
                path.push(key.clone());
                let redacted = redact_inner(val, policy, stats, path, map.as_deref_mut(), depth + 1);
                path.pop();
                out.insert(key.clone(), redacted);
            }
            Value::Object(out)
        }
        other => other.clone(),
    }
}

fn redact_string(
    input: &str,
    policy: &CompiledPolicy,
    stats: &mut Stats,
    mut map: Option<&mut ReplacementMap>,
) -> String {
    let mut current = input.to_string();

    for rule in &policy.rules {
        current = if rule.context_words.is_some() {
            apply_context_rule(&current, rule, policy, stats, map.as_deref_mut())
        } else {
            apply_global_rule(&current, rule, policy, stats, map.as_deref_mut())
        };
    }

    current
}

fn resolve_replacement(
    matched: &str,
    rule_id: &str,
    static_replacement: &str,
    map: &mut Option<&mut ReplacementMap>,
) -> String {
    match map {
        Some(m) => m.get_or_create(matched, rule_id),
        None => static_replacement.to_string(),
    }
}

fn apply_global_rule(
    current: &str,
    rule: &super::policy::Rule,
    policy: &CompiledPolicy,
    stats: &mut Stats,
    mut map: Option<&mut ReplacementMap>,
) -> String {
    let mut result = String::with_capacity(current.len());
    let mut last_end = 0;

    for m in rule.pattern.find_iter(current) {
        result.push_str(&current[last_end..m.start()]);
        let matched = m.as_str();
        if policy.allowlist.allows(matched) {
            result.push_str(matched);
        } else {
            stats.increment(&rule.id);
            let replacement = resolve_replacement(matched, &rule.id, &rule.replacement, &mut map);
            result.push_str(&replacement);
        }
        last_end = m.end();
    }
    result.push_str(&current[last_end..]);
    result
}

fn char_window(current: &str, byte_start: usize, byte_end: usize, window: usize) -> String {
    let indices: Vec<usize> = current.char_indices().map(|(b, _)| b).collect();
    let start_char_idx = indices
        .iter()
        .position(|&b| b >= byte_start)
        .unwrap_or(indices.len());
    let end_char_idx = indices
        .iter()
        .position(|&b| b >= byte_end)
        .unwrap_or(indices.len());

    let window_start_char = start_char_idx.saturating_sub(window);
    let window_end_char = (end_char_idx + window).min(indices.len());

    let window_start_byte = indices.get(window_start_char).copied().unwrap_or(0);
    let window_end_byte = indices
        .get(window_end_char)
        .copied()
        .unwrap_or(current.len());

    current[window_start_byte..window_end_byte].to_string()
}

fn apply_context_rule(
    current: &str,
    rule: &super::policy::Rule,
    policy: &CompiledPolicy,
    stats: &mut Stats,
    mut map: Option<&mut ReplacementMap>,
) -> String {
    let words = match &rule.context_words {
        Some(w) => w,
        None => return current.to_string(),
    };

    let matches: Vec<(usize, usize)> = rule
        .pattern
        .find_iter(current)
        .map(|m| (m.start(), m.end()))
        .collect();

    let mut buffer = current.to_string();

    for &(start, end) in matches.iter().rev() {
        let matched = &current[start..end];
        if policy.allowlist.allows(matched) {
            continue;
        }

        let window_text = char_window(current, start, end, rule.context_window).to_lowercase();
        let has_context = words.iter().any(|w| window_text.contains(w.as_str()));
        if !has_context {
            continue;
        }

        stats.increment(&rule.id);
        let replacement = resolve_replacement(matched, &rule.id, &rule.replacement, &mut map);
        buffer.replace_range(start..end, &replacement);
    }

    buffer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::redact::presets::compile_preset;
    use crate::config::Preset;

    #[test]
    fn redacts_email_one_way() {
        let policy = compile_preset(Preset::Pii);
        let mut stats = Stats::new();
        let value = Value::String("reach me at john@example.com please".to_string());
        let redacted = redact_value(&value, &policy, &mut stats, None);
        assert_eq!(
            redacted,
            Value::String("reach me at [EMAIL_REDACTED] please".to_string())
        );
        assert_eq!(stats.get("email"), 1);
    }

    #[test]
    fn redacts_context_gated_ssn_only_with_context() {
        let policy = compile_preset(Preset::Pii);
        let mut stats = Stats::new();
        let with_context = Value::String("my SSN is 123-45-6789".to_string());
        let redacted = redact_value(&with_context, &policy, &mut stats, None);
        assert!(matches!(redacted, Value::String(ref s) if s.contains("[SSN_REDACTED]")));

        let mut stats2 = Stats::new();
        let without_context = Value::String("order number 123-45-6789".to_string());
        let redacted2 = redact_value(&without_context, &policy, &mut stats2, None);
        assert_eq!(
            redacted2,
            Value::String("order number 123-45-6789".to_string())
        );
    }

    #[test]
    fn reversible_mode_uses_replacement_map() {
        let policy = compile_preset(Preset::Pii);
        let mut stats = Stats::new();
        let mut map = ReplacementMap::new();
        let value = Value::String("email john@example.com".to_string());
        let redacted = redact_value(&value, &policy, &mut stats, Some(&mut map));
        let Value::String(redacted_str) = redacted else {
            panic!("expected string")
        };
        assert!(redacted_str.contains("[EMAIL_1]"));
        assert_eq!(map.rehydrate(&redacted_str), "email john@example.com");
    }

    #[test]
    fn traverses_arrays_and_objects() {
        let policy = compile_preset(Preset::Pii);
        let mut stats = Stats::new();
        let value = serde_json::json!({
            "messages": [
                {"role": "user", "content": "contact a@example.com"}
            ]
        });
        let redacted = redact_value(&value, &policy, &mut stats, None);
        assert_eq!(
            redacted["messages"][0]["content"],
            Value::String("contact [EMAIL_REDACTED]".to_string())
        );
    }

    #[test]
    fn redaction_is_idempotent() {
        let policy = compile_preset(Preset::Pii);
        let mut stats = Stats::new();
        let value = Value::String("contact a@example.com".to_string());
        let once = redact_value(&value, &policy, &mut stats, None);
        let mut stats2 = Stats::new();
        let twice = redact_value(&once, &policy, &mut stats2, None);
        assert_eq!(once, twice);
    }

    #[test]
    fn non_mutating_leaves_input_untouched() {
        let policy = compile_preset(Preset::Pii);
        let mut stats = Stats::new();
        let value = serde_json::json!({"content": "a@example.com"});
        let original = value.clone();
        let _ = redact_value(&value, &policy, &mut stats, None);
        assert_eq!(value, original);
    }

    #[test]
    fn path_scoping_skips_configured_paths() {
        use crate::redact::policy::{Allowlist, CompiledPolicy, PathMatcher, PathScoping, Rule};
        let policy = CompiledPolicy {
            rules: vec![Rule {
                id: "email".to_string(),
                pattern: regex::Regex::new(r"[a-z]+@[a-z.]+").unwrap(),
                replacement: "[EMAIL_REDACTED]".to_string(),
                context_words: None,
                context_window: 0,
            }],
            allowlist: Allowlist::default(),
            paths: PathScoping {
                only: None,
                skip: vec![PathMatcher::parse("metadata/*")],
            },
        };
        let mut stats = Stats::new();
        let value = serde_json::json!({"metadata": {"email": "a@b.com"}, "body": {"email": "c@d.com"}});
        let redacted = redact_value(&value, &policy, &mut stats, None);
        assert_eq!(redacted["metadata"]["email"], Value::String("a@b.com".to_string()));
        assert_eq!(
            redacted["body"]["email"],
            Value::String("[EMAIL_REDACTED]".to_string())
        );
    }
}
