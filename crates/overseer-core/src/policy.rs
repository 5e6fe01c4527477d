// Policy evaluator
// First-match-wins declarative rules over tools, paths and commands.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use overseer_types::{Decision, Evaluation, PolicyProfile, PolicyRule, ToolCall};

use crate::error::{OverseerError, Result};

// ============================================================================
// Compiled profiles
// ============================================================================

/// A profile with its rule patterns pre-compiled. Profiles are read-mostly;
/// compile once at load, share by reference.
#[derive(Debug)]
pub struct CompiledProfile {
    profile: PolicyProfile,
    rules: Vec<CompiledRule>,
}

#[derive(Debug)]
struct CompiledRule {
    tool: String,
    sub_pattern: Option<String>,
    decision: Decision,
    path_allow: Option<GlobSet>,
    path_deny: Option<GlobSet>,
    command_allow: Vec<String>,
    command_deny: Vec<String>,
}

impl CompiledProfile {
    /// Validate and compile a profile. Malformed globs and structural
    /// problems are rejected here so evaluation itself is total.
    pub fn compile(profile: &PolicyProfile) -> Result<Self> {
        profile.validate()?;

        let mut rules = Vec::with_capacity(profile.rules.len());
        for (index, rule) in profile.rules.iter().enumerate() {
            rules.push(CompiledRule::compile(rule).map_err(|e| {
                OverseerError::Validation(format!(
                    "Profile '{}' rule {}: {}",
                    profile.name, index, e
                ))
            })?);
        }

        Ok(Self {
            profile: profile.clone(),
            rules,
        })
    }

    pub fn profile(&self) -> &PolicyProfile {
        &self.profile
    }

    /// Evaluate one tool call. Pure, deterministic, O(rules).
    pub fn evaluate(&self, call: &ToolCall) -> Evaluation {
        for (index, rule) in self.rules.iter().enumerate() {
            if !match_tool(&rule.tool, &call.tool) {
                continue;
            }
            if let Some(sub) = rule.sub_pattern.as_deref() {
                let subject = call.command.as_deref().unwrap_or("");
                if !wildcard_matches(sub, subject) {
                    continue;
                }
            }

            // Path constraints. A non-empty allow list scopes the rule to
            // matching paths; a deny match wins over everything in the rule.
            if let Some(allow) = rule.path_allow.as_ref() {
                match call.path.as_deref() {
                    Some(path) if allow.is_match(path) => {}
                    _ => continue,
                }
            }
            if let Some(deny) = rule.path_deny.as_ref() {
                if let Some(path) = call.path.as_deref() {
                    if deny.is_match(path) {
                        return Evaluation {
                            decision: Decision::Deny,
                            rule_index: index as i32,
                            reason: Some("path_deny".to_string()),
                        };
                    }
                }
            }

            // Command constraints, matched on the normalised prefix.
            let command = call.command.as_deref().map(normalize_command);
            if !rule.command_allow.is_empty() {
                let matched = command
                    .as_deref()
                    .is_some_and(|c| rule.command_allow.iter().any(|p| prefix_matches(p, c)));
                if !matched {
                    continue;
                }
            }
            if let Some(command) = command.as_deref() {
                if rule.command_deny.iter().any(|p| prefix_matches(p, command)) {
                    return Evaluation {
                        decision: Decision::Deny,
                        rule_index: index as i32,
                        reason: Some("command_deny".to_string()),
                    };
                }
            }

            return Evaluation {
                decision: rule.decision,
                rule_index: index as i32,
                reason: None,
            };
        }

        Evaluation {
            decision: self.profile.mode.default_decision(),
            rule_index: -1,
            reason: Some("mode_default".to_string()),
        }
    }
}

impl CompiledRule {
    fn compile(rule: &PolicyRule) -> Result<Self> {
        Ok(Self {
            tool: rule.specifier.tool.clone(),
            sub_pattern: rule.specifier.sub_pattern.clone(),
            decision: rule.decision,
            path_allow: compile_globs(&rule.path_allow)?,
            path_deny: compile_globs(&rule.path_deny)?,
            command_allow: rule.command_allow.iter().map(|c| normalize_command(c)).collect(),
            command_deny: rule.command_deny.iter().map(|c| normalize_command(c)).collect(),
        })
    }
}

fn compile_globs(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| OverseerError::Validation(format!("Bad glob '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map(Some)
        .map_err(|e| OverseerError::Validation(format!("Glob set: {}", e)))
}

/// Convenience: compile-and-evaluate in one shot. The hot path keeps a
/// `CompiledProfile` instead.
pub fn evaluate(profile: &PolicyProfile, call: &ToolCall) -> Result<Evaluation> {
    Ok(CompiledProfile::compile(profile)?.evaluate(call))
}

// ============================================================================
// Matchers
// ============================================================================

/// Tool matching with wildcards at `:` segment boundaries.
/// `*` matches everything; `mcp:*` matches any tool under `mcp`;
/// `mcp:*:read` matches exactly one segment in the middle.
pub fn match_tool(pattern: &str, tool: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    let pattern_segments: Vec<&str> = pattern.split(':').collect();
    let tool_segments: Vec<&str> = tool.split(':').collect();

    for (index, segment) in pattern_segments.iter().enumerate() {
        if *segment == "*" && index == pattern_segments.len() - 1 {
            // Trailing wildcard swallows the remaining segments.
            return tool_segments.len() >= pattern_segments.len();
        }
        match tool_segments.get(index) {
            Some(actual) if *segment == "*" || actual == segment => {}
            _ => return false,
        }
    }
    pattern_segments.len() == tool_segments.len()
}

/// Plain `*` wildcard matching for sub-patterns.
fn wildcard_matches(pattern: &str, value: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains('*') {
        return pattern == value;
    }
    let mut remaining = value;
    let mut is_first = true;
    for part in pattern.split('*') {
        if part.is_empty() {
            continue;
        }
        if is_first {
            if let Some(stripped) = remaining.strip_prefix(part) {
                remaining = stripped;
            } else {
                return false;
            }
            is_first = false;
            continue;
        }
        if let Some(index) = remaining.find(part) {
            remaining = &remaining[index + part.len()..];
        } else {
            return false;
        }
    }
    pattern.ends_with('*') || remaining.is_empty()
}

/// Normalise a command line to its first three whitespace-separated tokens.
fn normalize_command(command: &str) -> String {
    command
        .split_whitespace()
        .take(3)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Byte-prefix match over normalised command lines.
fn prefix_matches(prefix: &str, command: &str) -> bool {
    !prefix.is_empty() && command.as_bytes().starts_with(prefix.as_bytes())
}

// ============================================================================
// Tests
// ============================================================================
