//! Bidirectional original-to-placeholder table, per session. Per spec.md
//! §4.3: the same original string always maps to the same placeholder
//! regardless of which rule asks for it a second time; placeholders are
//! globally unique within one map; labels are `[RULEID_N]`.

use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct ReplacementMap {
    forward: HashMap<String, String>,
    reverse: HashMap<String, String>,
    counters: HashMap<String, u64>,
}

fn normalize_rule_id(rule_id: &str) -> String {
    rule_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}

impl ReplacementMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the placeholder for `original`, creating one scoped to
    /// `rule_id` if this is the first time this original string has been
    /// seen (under any rule).
    pub fn get_or_create(&mut self, original: &str, rule_id: &str) -> String {
        if let Some(existing) = self.forward.get(original) {
            return existing.clone();
        }

        let normalized = normalize_rule_id(rule_id);
        let counter = self.counters.entry(normalized.clone()).or_insert(0);
        *counter += 1;
        let placeholder = format!("[{normalized}_{counter}]");

        self.forward.insert(original.to_string(), placeholder.clone());
        self.reverse.insert(placeholder.clone(), original.to_string());
        placeholder
    }

    /// Replaces every known placeholder occurrence in `text` with its
    /// original value. Placeholders are applied longest-first so that e.g.
    /// `[EMAIL_10]` is substituted before `[EMAIL_1]`.
    pub fn rehydrate(&self, text: &str) -> String {
        if self.reverse.is_empty() {
            return text.to_string();
        }

        let mut placeholders: Vec<&String> = self.reverse.keys().collect();
        placeholders.sort_by_key(|p| std::cmp::Reverse(p.len()));

        let mut result = text.to_string();
        for placeholder in placeholders {
            let original = &self.reverse[placeholder];
            if result.contains(placeholder.as_str()) {
                result = result.replace(placeholder.as_str(), original);
            }
        }
        result
    }

    pub fn size(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn iter_placeholders(&self) -> impl Iterator<Item = &String> {
        self.reverse.keys()
    }

    pub fn iter_entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.forward.iter()
    }
}
