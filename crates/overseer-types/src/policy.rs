// Declarative tool-call policy profiles.

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ============================================================================
// Modes and decisions
// ============================================================================

/// Profile mode; fixes the decision when no rule matches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyMode {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "acceptEdits")]
    AcceptEdits,
    #[serde(rename = "plan")]
    Plan,
    #[serde(rename = "delegate")]
    Delegate,
}

impl PolicyMode {
    /// Decision applied when no rule matches
    pub fn default_decision(&self) -> Decision {
        match self {
            PolicyMode::Plan => Decision::Deny,
            PolicyMode::Default => Decision::Ask,
            PolicyMode::AcceptEdits | PolicyMode::Delegate => Decision::Allow,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Deny,
    Ask,
}

impl Decision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Allow => "allow",
            Decision::Deny => "deny",
            Decision::Ask => "ask",
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Tool selector; supports wildcards at segment boundaries
/// (`*`, `mcp:*`, `mcp:filesystem:*`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSpecifier {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_pattern: Option<String>,
}

impl ToolSpecifier {
    pub fn tool(name: impl Into<String>) -> Self {
        Self {
            tool: name.into(),
            sub_pattern: None,
        }
    }
}

/// One ordered policy rule; first match wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub specifier: ToolSpecifier,
    pub decision: Decision,
    /// Path globs; non-empty means the call's path must match one
    #[serde(default)]
    pub path_allow: Vec<String>,
    /// Path globs; any match forces deny
    #[serde(default)]
    pub path_deny: Vec<String>,
    /// Command prefixes; non-empty means the call's command must match one
    #[serde(default)]
    pub command_allow: Vec<String>,
    /// Command prefixes; any match forces deny
    #[serde(default)]
    pub command_deny: Vec<String>,
}

impl PolicyRule {
    pub fn new(specifier: ToolSpecifier, decision: Decision) -> Self {
        Self {
            specifier,
            decision,
            path_allow: Vec::new(),
            path_deny: Vec::new(),
            command_allow: Vec::new(),
            command_deny: Vec::new(),
        }
    }
}

// ============================================================================
// Quality gate and termination bounds
// ============================================================================

/// Commands the engine runs through the worker before accepting completion
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QualityGate {
    #[serde(default)]
    pub require_tests_pass: bool,
    #[serde(default)]
    pub require_lint_pass: bool,
    #[serde(default)]
    pub test_command: String,
    #[serde(default)]
    pub lint_command: String,
    /// Rewind the workspace to the last checkpoint when the gate fails
    #[serde(default)]
    pub rollback_on_gate_fail: bool,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            require_tests_pass: false,
            require_lint_pass: false,
            test_command: String::new(),
            lint_command: String::new(),
            rollback_on_gate_fail: false,
        }
    }
}

/// Per-run termination bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Termination {
    pub max_steps: u64,
    pub timeout_seconds: u64,
    pub max_cost: f64,
    #[serde(default)]
    pub stall_detection: bool,
    #[serde(default)]
    pub stall_threshold: u32,
}

impl Default for Termination {
    fn default() -> Self {
        Self {
            max_steps: 200,
            timeout_seconds: 30 * 60,
            max_cost: 10.0,
            stall_detection: true,
            stall_threshold: 5,
        }
    }
}

// ============================================================================
// Profile
// ============================================================================

/// A named bundle of tool rules, a quality gate, and termination bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub name: String,
    pub mode: PolicyMode,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
    #[serde(default)]
    pub quality_gate: QualityGate,
    #[serde(default)]
    pub termination: Termination,
}

impl PolicyProfile {
    pub fn new(name: impl Into<String>, mode: PolicyMode) -> Self {
        Self {
            name: name.into(),
            mode,
            rules: Vec::new(),
            quality_gate: QualityGate::default(),
            termination: Termination::default(),
        }
    }

    /// Structural validation, applied at profile load time. Unknown modes and
    /// decisions are already rejected during deserialization; this catches
    /// the remaining malformed shapes.
    pub fn validate(&self) -> Result<(), ProfileError> {
        if self.name.trim().is_empty() {
            return Err(ProfileError::EmptyName);
        }
        for (index, rule) in self.rules.iter().enumerate() {
            if rule.specifier.tool.trim().is_empty() {
                return Err(ProfileError::EmptyToolSpecifier { rule_index: index });
            }
        }
        if self.termination.stall_detection && self.termination.stall_threshold == 0 {
            return Err(ProfileError::ZeroStallThreshold);
        }
        Ok(())
    }
}

/// Profile validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfileError {
    EmptyName,
    EmptyToolSpecifier { rule_index: usize },
    ZeroStallThreshold,
}

impl std::fmt::Display for ProfileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyName => write!(f, "Profile name is empty"),
            Self::EmptyToolSpecifier { rule_index } => {
                write!(f, "Rule {} has an empty tool specifier", rule_index)
            }
            Self::ZeroStallThreshold => {
                write!(f, "Stall detection enabled with a zero threshold")
            }
        }
    }
}

impl std::error::Error for ProfileError {}

// ============================================================================
// Tool calls
// ============================================================================

/// A worker's request to invoke a named operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Value>,
}

impl ToolCall {
    pub fn named(tool: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            command: None,
            path: None,
            args: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }
}

/// Outcome of evaluating a profile against one tool call
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub decision: Decision,
    /// Index of the deciding rule; -1 when the mode default applied
    pub rule_index: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}
