//! Compiled redaction policies: rules, allowlist, path scoping, and the
//! JSON-with-comments policy-file loader. Per spec.md §4.4.

use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use std::collections::HashSet;

/// One compiled redaction rule.
pub struct Rule {
    pub id: String,
    pub pattern: Regex,
    pub replacement: String,
    /// Lowercased context words; `None` means the rule applies globally with
    /// no context gating.
    pub context_words: Option<Vec<String>>,
    pub context_window: usize,
}

#[derive(Default)]
pub struct Allowlist {
    pub exact: HashSet<String>,
    pub patterns: Vec<Regex>,
}

impl Allowlist {
    pub fn allows(&self, text: &str) -> bool {
        if self.exact.contains(text) {
            return true;
        }
        self.patterns.iter().any(|p| {
            p.find(text)
                .map(|m| m.start() == 0 && m.end() == text.len())
                .unwrap_or(false)
        })
    }
}

/// A path matcher: a sequence of segments where `*` matches any single
/// segment. Two paths match when segment counts are equal and every pair is
/// either `*` on the matcher side or literally equal.
#[derive(Debug, Clone)]
pub struct PathMatcher(pub Vec<String>);

impl PathMatcher {
    pub fn parse(spec: &str) -> Self {
        let segments = spec
            .trim_matches('/')
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();
        PathMatcher(segments)
    }

    pub fn matches(&self, path: &[String]) -> bool {
        if self.0.len() != path.len() {
            return false;
        }
        self.0
            .iter()
            .zip(path.iter())
            .all(|(m, p)| m == "*" || m == p)
    }
}

#[derive(Default)]
pub struct PathScoping {
    pub only: Option<Vec<PathMatcher>>,
    pub skip: Vec<PathMatcher>,
}

impl PathScoping {
    pub fn allows(&self, path: &[String]) -> bool {
        if self.skip.iter().any(|m| m.matches(path)) {
            return false;
        }
        if let Some(only) = &self.only {
            return only.iter().any(|m| m.matches(path));
        }
        true
    }
}

#[derive(Default)]
pub struct CompiledPolicy {
    pub rules: Vec<Rule>,
    pub allowlist: Allowlist,
    pub paths: PathScoping,
}

#[derive(Deserialize)]
struct PolicyFile {
    #[serde(default)]
    rules: Vec<RuleDef>,
    #[serde(default)]
    allowlist: AllowlistDef,
    #[serde(default)]
    paths: PathsDef,
}

#[derive(Deserialize)]
struct RuleDef {
    id: String,
    pattern: String,
    replacement: String,
    #[serde(default)]
    context: Option<Vec<String>>,
    #[serde(default)]
    context_window: Option<usize>,
}

#[derive(Deserialize, Default)]
struct AllowlistDef {
    #[serde(default)]
    exact: Vec<String>,
    #[serde(default)]
    patterns: Vec<String>,
}

#[derive(Deserialize, Default)]
struct PathsDef {
    #[serde(default)]
    only: Option<Vec<String>>,
    #[serde(default)]
    skip: Vec<String>,
}

fn compile_rule_def(def: RuleDef) -> anyhow::Result<Rule> {
    let (source, forced_ci) = if let Some(stripped) = def.pattern.strip_prefix("(?i)") {
        (stripped.to_string(), true)
    } else {
        (def.pattern, false)
    };

    let pattern = RegexBuilder::new(&source)
        .case_insensitive(forced_ci)
        .build()?;

    Ok(Rule {
        id: def.id,
        pattern,
        replacement: def.replacement,
        context_words: def
            .context
            .map(|words| words.into_iter().map(|w| w.to_lowercase()).collect()),
        context_window: def.context_window.unwrap_or(0),
    })
}

/// Strips `//`-prefixed comment lines and trailing commas before `}`/`]`
/// from a "JSON-with-comments" policy source.
pub fn strip_json_comments(source: &str) -> String {
    let without_comments: String = source
        .lines()
        .map(|line| {
            if line.trim_start().starts_with("//") {
                ""
            } else {
                line
            }
        })
        .collect::<Vec<_>>()
        .join("\n");

    let mut out = String::with_capacity(without_comments.len());
    let chars: Vec<char> = without_comments.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if chars[i] == ',' {
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1;
                continue;
            }
        }
        out.push(chars[i]);
        i += 1;
    }
    out
}

fn compile_policy_file(file: PolicyFile) -> anyhow::Result<CompiledPolicy> {
    let mut rules = Vec::with_capacity(file.rules.len());
    for def in file.rules {
        rules.push(compile_rule_def(def)?);
    }

    let mut allow_patterns = Vec::with_capacity(file.allowlist.patterns.len());
    for p in file.allowlist.patterns {
        allow_patterns.push(Regex::new(&p)?);
    }

    let only = file
        .paths
        .only
        .map(|specs| specs.iter().map(|s| PathMatcher::parse(s)).collect());
    let skip = file.paths.skip.iter().map(|s| PathMatcher::parse(s)).collect();

    Ok(CompiledPolicy {
        rules,
        allowlist: Allowlist {
            exact: file.allowlist.exact.into_iter().collect(),
            patterns: allow_patterns,
        },
        paths: PathScoping { only, skip },
    })
}

/// Reads and compiles a policy file from disk, optionally extending `preset`.
pub fn compile_policy_from_path(
    path: &std::path::Path,
    preset: Option<CompiledPolicy>,
) -> anyhow::Result<CompiledPolicy> {
    let source = std::fs::read_to_string(path)?;
    compile_policy_source(&source, preset)
}

/// Parses a JSON-with-comments policy source and compiles it, optionally
/// prepending a preset's rules in preset order ("extending" the preset).
pub fn compile_policy_source(
    source: &str,
    preset: Option<CompiledPolicy>,
) -> anyhow::Result<CompiledPolicy> {
    let stripped = strip_json_comments(source);
    let file: PolicyFile = serde_json::from_str(&stripped)?;
    let user_policy = compile_policy_file(file)?;

    match preset {
        None => Ok(user_policy),
        Some(mut base) => {
            base.rules.extend(user_policy.rules);
            base.allowlist.exact.extend(user_policy.allowlist.exact);
            base.allowlist.patterns.extend(user_policy.allowlist.patterns);
            if let Some(user_only) = user_policy.paths.only {
                let mut only = base.paths.only.unwrap_or_default();
                only.extend(user_only);
                base.paths.only = Some(only);
            }
            base.paths.skip.extend(user_policy.paths.skip);
            Ok(base)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_comment_lines() {
        let src = "{\n  // a comment\n  \"rules\": []\n}";
        let stripped = strip_json_comments(src);
        assert!(!stripped.contains("comment"));
        let _: serde_json::Value = serde_json::from_str(&stripped).unwrap();
    }

    #[test]
    fn strips_trailing_commas() {
        let src = r#"{"rules": [1, 2, ],}"#;
        let stripped = strip_json_comments(src);
        let value: serde_json::Value = serde_json::from_str(&stripped).unwrap();
        assert_eq!(value["rules"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn compiles_case_insensitive_leading_flag() {
        let src = r#"{"rules": [{"id": "x", "pattern": "(?i)hello", "replacement": "[X]"}]}"#;
        let policy = compile_policy_source(src, None).unwrap();
        assert!(policy.rules[0].pattern.is_match("HELLO"));
    }

    #[test]
    fn path_matcher_wildcard_segment() {
        let matcher = PathMatcher::parse("messages/*/content");
        assert!(matcher.matches(&[
            "messages".to_string(),
            "0".to_string(),
            "content".to_string()
        ]));
        assert!(!matcher.matches(&["messages".to_string(), "content".to_string()]));
    }

    #[test]
    fn extending_preset_prepends_preset_rules() {
        let preset = CompiledPolicy {
            rules: vec![],
            allowlist: Allowlist::default(),
            paths: PathScoping::default(),
        };
        let src = r#"{"rules": [{"id": "custom", "pattern": "x", "replacement": "[X]"}]}"#;
        let policy = compile_policy_source(src, Some(preset)).unwrap();
        assert_eq!(policy.rules.len(), 1);
        assert_eq!(policy.rules[0].id, "custom");
    }
}
