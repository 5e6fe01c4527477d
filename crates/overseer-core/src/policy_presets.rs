// Compiled-in policy presets, selected by name at startup.

use overseer_types::{Decision, PolicyMode, PolicyProfile, PolicyRule, ToolSpecifier};

fn allow(tool: &str) -> PolicyRule {
    PolicyRule::new(ToolSpecifier::tool(tool), Decision::Allow)
}

/// The profile applied when a step omits one: read paths freely, ask for
/// shell, edits decided by the mode default.
pub fn default_profile() -> PolicyProfile {
    let mut profile = PolicyProfile::new("default", PolicyMode::Default);
    profile.rules = vec![
        allow("Read"),
        allow("Glob"),
        allow("Grep"),
        allow("Ls"),
        PolicyRule::new(ToolSpecifier::tool("Bash"), Decision::Ask),
    ];
    profile
}

/// Read-only exploration; everything mutating denied by plan mode.
pub fn read_only_profile() -> PolicyProfile {
    let mut profile = PolicyProfile::new("read-only", PolicyMode::Plan);
    profile.rules = vec![allow("Read"), allow("Glob"), allow("Grep"), allow("Ls")];
    profile
}

/// Unattended editing with guard rails on version-control internals and
/// destructive shell commands.
pub fn auto_edit_profile() -> PolicyProfile {
    let mut profile = PolicyProfile::new("auto-edit", PolicyMode::AcceptEdits);
    let mut edits = PolicyRule::new(ToolSpecifier::tool("Edit"), Decision::Allow);
    edits.path_deny = vec!["**/.git/**".to_string()];
    let mut writes = PolicyRule::new(ToolSpecifier::tool("Write"), Decision::Allow);
    writes.path_deny = vec!["**/.git/**".to_string()];
    let mut shell = PolicyRule::new(ToolSpecifier::tool("Bash"), Decision::Allow);
    shell.command_deny = vec![
        "rm -rf".to_string(),
        "git push --force".to_string(),
        "git reset --hard".to_string(),
    ];
    profile.rules = vec![edits, writes, shell];
    profile
}

/// Full delegation; the worker self-governs.
pub fn delegate_profile() -> PolicyProfile {
    PolicyProfile::new("delegate", PolicyMode::Delegate)
}

pub fn builtin_profiles() -> Vec<PolicyProfile> {
    vec![
        default_profile(),
        read_only_profile(),
        auto_edit_profile(),
        delegate_profile(),
    ]
}

pub fn builtin(name: &str) -> Option<PolicyProfile> {
    builtin_profiles().into_iter().find(|p| p.name == name)
}
