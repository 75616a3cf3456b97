//! Permission policy: profiles, rules and first-match-wins evaluation.
//!
//! A [`PolicyProfile`] is the editable, serializable form. It must be compiled
//! into a [`CompiledProfile`] (which validates every glob and gate) before a
//! run can use it; [`evaluate`] then never fails.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::pattern::{Pattern, PatternError};
use crate::core::types::ToolCall;

/// Outcome kind of a policy decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionKind {
    Allow,
    Deny,
    Ask,
}

impl DecisionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
            Self::Ask => "ask",
        }
    }
}

/// Result of evaluating a tool call against a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub kind: DecisionKind,
    /// Index of the matching rule; `None` when the profile default applied.
    pub rule_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    #[serde(default = "match_all")]
    pub tool: String,
    #[serde(default = "match_all")]
    pub action: String,
    #[serde(default = "match_all")]
    pub path: String,
    pub decision: DecisionKind,
}

impl PermissionRule {
    pub fn new(tool: &str, action: &str, path: &str, decision: DecisionKind) -> Self {
        Self {
            tool: tool.to_string(),
            action: action.to_string(),
            path: path.to_string(),
            decision,
        }
    }
}

fn match_all() -> String {
    "*".to_string()
}

/// A command that must succeed before a run may complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGate {
    pub name: String,
    pub command: Vec<String>,
    #[serde(default = "default_gate_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_gate_timeout_secs() -> u64 {
    30 * 60
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TerminationCondition {
    MaxSteps { limit: u32 },
    MaxCost { usd: f64 },
}

/// Serializable policy profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_decision")]
    pub default_decision: DecisionKind,
    #[serde(default)]
    pub rules: Vec<PermissionRule>,
    #[serde(default)]
    pub quality_gates: Vec<QualityGate>,
    #[serde(default)]
    pub termination: Vec<TerminationCondition>,
}

fn default_decision() -> DecisionKind {
    DecisionKind::Deny
}

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("profile name must be non-empty and use [A-Za-z0-9_-]")]
    InvalidName,
    #[error("profile '{profile}' rule {index}: {source}")]
    Pattern {
        profile: String,
        index: usize,
        #[source]
        source: PatternError,
    },
    #[error("profile '{profile}' quality gate '{gate}': {message}")]
    Gate {
        profile: String,
        gate: String,
        message: String,
    },
    #[error("profile '{profile}': {message}")]
    Termination { profile: String, message: String },
}

#[derive(Debug, Clone)]
struct CompiledRule {
    tool: Pattern,
    action: Pattern,
    path: Pattern,
    decision: DecisionKind,
}

/// A validated profile, ready for evaluation. Immutable for the lifetime of a run.
#[derive(Debug, Clone)]
pub struct CompiledProfile {
    profile: PolicyProfile,
    rules: Vec<CompiledRule>,
}

impl CompiledProfile {
    pub fn name(&self) -> &str {
        &self.profile.name
    }

    pub fn profile(&self) -> &PolicyProfile {
        &self.profile
    }

    pub fn quality_gates(&self) -> &[QualityGate] {
        &self.profile.quality_gates
    }

    pub fn termination(&self) -> &[TerminationCondition] {
        &self.profile.termination
    }
}

impl PolicyProfile {
    /// Validate names, globs, gates and termination conditions.
    pub fn compile(self) -> Result<CompiledProfile, PolicyError> {
        let valid_name = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid_name {
            return Err(PolicyError::InvalidName);
        }

        let mut rules = Vec::with_capacity(self.rules.len());
        for (index, rule) in self.rules.iter().enumerate() {
            let compile = |raw: &str| {
                Pattern::compile(raw).map_err(|source| PolicyError::Pattern {
                    profile: self.name.clone(),
                    index,
                    source,
                })
            };
            rules.push(CompiledRule {
                tool: compile(&rule.tool)?,
                action: compile(&rule.action)?,
                path: compile(&rule.path)?,
                decision: rule.decision,
            });
        }

        for gate in &self.quality_gates {
            let gate_error = |message: &str| PolicyError::Gate {
                profile: self.name.clone(),
                gate: gate.name.clone(),
                message: message.to_string(),
            };
            if gate.name.trim().is_empty() {
                return Err(gate_error("name must be non-empty"));
            }
            if gate.command.first().is_none_or(|cmd| cmd.trim().is_empty()) {
                return Err(gate_error("command must be a non-empty array"));
            }
            if gate.timeout_secs == 0 {
                return Err(gate_error("timeout_secs must be > 0"));
            }
        }

        for condition in &self.termination {
            let invalid = match condition {
                TerminationCondition::MaxSteps { limit } => *limit == 0,
                TerminationCondition::MaxCost { usd } => !usd.is_finite() || *usd <= 0.0,
            };
            if invalid {
                return Err(PolicyError::Termination {
                    profile: self.name.clone(),
                    message: format!("termination condition {condition:?} must be positive"),
                });
            }
        }

        Ok(CompiledProfile {
            profile: self,
            rules,
        })
    }
}

/// Evaluate a tool call: the first rule whose tool, action and path all match
/// wins; otherwise the profile default applies. A call without a path is
/// matched against the empty string.
pub fn evaluate(profile: &CompiledProfile, call: &ToolCall) -> Decision {
    let path = call.path.as_deref().unwrap_or("");
    profile
        .rules
        .iter()
        .position(|rule| {
            rule.tool.matches(&call.tool)
                && rule.action.matches(&call.action)
                && rule.path.matches(path)
        })
        .map(|index| Decision {
            kind: profile.rules[index].decision,
            rule_index: Some(index),
        })
        .unwrap_or(Decision {
            kind: profile.profile.default_decision,
            rule_index: None,
        })
}

pub const PLAN_READONLY: &str = "plan-readonly";
pub const HEADLESS_SAFE_SANDBOX: &str = "headless-safe-sandbox";
pub const HEADLESS_PERMISSIVE_SANDBOX: &str = "headless-permissive-sandbox";
pub const TRUSTED_MOUNT_AUTONOMOUS: &str = "trusted-mount-autonomous";

/// The read-only profiles shipped with the orchestrator.
pub fn builtin_profiles() -> Vec<PolicyProfile> {
    use DecisionKind::{Allow, Ask, Deny};

    let read_tools = "{read,grep,glob,list,search}";
    let ci_gate = QualityGate {
        name: "tests-pass".to_string(),
        command: vec!["just".to_string(), "ci".to_string()],
        timeout_secs: default_gate_timeout_secs(),
    };

    vec![
        PolicyProfile {
            name: PLAN_READONLY.to_string(),
            description: "Read and search only; every mutation is denied.".to_string(),
            default_decision: Deny,
            rules: vec![PermissionRule::new(read_tools, "*", "*", Allow)],
            quality_gates: Vec::new(),
            termination: vec![TerminationCondition::MaxSteps { limit: 30 }],
        },
        PolicyProfile {
            name: HEADLESS_SAFE_SANDBOX.to_string(),
            description: "Unattended sandbox: edits inside the workspace, no shell or network."
                .to_string(),
            default_decision: Deny,
            rules: vec![
                PermissionRule::new(read_tools, "*", "*", Allow),
                PermissionRule::new("*", "*", "{/*,~*,*..*}", Deny),
                PermissionRule::new("{edit,write}", "*", "*", Allow),
            ],
            quality_gates: Vec::new(),
            termination: vec![
                TerminationCondition::MaxSteps { limit: 50 },
                TerminationCondition::MaxCost { usd: 5.0 },
            ],
        },
        PolicyProfile {
            name: HEADLESS_PERMISSIVE_SANDBOX.to_string(),
            description: "Unattended sandbox with shell access; network calls need approval."
                .to_string(),
            default_decision: Ask,
            rules: vec![
                PermissionRule::new("*", "*", "{*.git/*,.git}", Deny),
                PermissionRule::new("{network,fetch,http}", "*", "*", Ask),
                PermissionRule::new("*", "*", "*", Allow),
            ],
            quality_gates: vec![ci_gate.clone()],
            termination: vec![
                TerminationCondition::MaxSteps { limit: 100 },
                TerminationCondition::MaxCost { usd: 20.0 },
            ],
        },
        PolicyProfile {
            name: TRUSTED_MOUNT_AUTONOMOUS.to_string(),
            description: "Trusted agent on a mounted checkout; git internals stay protected."
                .to_string(),
            default_decision: Allow,
            rules: vec![PermissionRule::new("*", "{write,edit,delete}", "{*.git/*,.git}", Deny)],
            quality_gates: vec![ci_gate],
            termination: Vec::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(default_decision: DecisionKind, rules: Vec<PermissionRule>) -> CompiledProfile {
        PolicyProfile {
            name: "test".to_string(),
            description: String::new(),
            default_decision,
            rules,
            quality_gates: Vec::new(),
            termination: Vec::new(),
        }
        .compile()
        .expect("compile")
    }

    #[test]
    fn first_matching_rule_wins() {
        let p = profile(
            DecisionKind::Deny,
            vec![
                PermissionRule::new("fs", "write", "src/*", DecisionKind::Allow),
                PermissionRule::new("fs", "write", "*", DecisionKind::Ask),
            ],
        );
        let call = ToolCall::new("fs", "write").with_path("src/lib.rs");
        assert_eq!(
            evaluate(&p, &call),
            Decision {
                kind: DecisionKind::Allow,
                rule_index: Some(0)
            }
        );
        let call = ToolCall::new("fs", "write").with_path("README.md");
        assert_eq!(
            evaluate(&p, &call),
            Decision {
                kind: DecisionKind::Ask,
                rule_index: Some(1)
            }
        );
    }

    #[test]
    fn default_applies_when_nothing_matches() {
        let p = profile(
            DecisionKind::Ask,
            vec![PermissionRule::new("fs", "read", "*", DecisionKind::Allow)],
        );
        let decision = evaluate(&p, &ToolCall::new("shell", "exec"));
        assert_eq!(decision.kind, DecisionKind::Ask);
        assert_eq!(decision.rule_index, None);
    }

    #[test]
    fn missing_path_matches_only_patterns_accepting_empty() {
        let p = profile(
            DecisionKind::Deny,
            vec![
                PermissionRule::new("shell", "*", "?*", DecisionKind::Ask),
                PermissionRule::new("shell", "*", "*", DecisionKind::Allow),
            ],
        );
        let decision = evaluate(&p, &ToolCall::new("shell", "exec"));
        assert_eq!(decision.rule_index, Some(1));
    }

    #[test]
    fn invalid_pattern_is_rejected_at_compile() {
        let err = PolicyProfile {
            name: "broken".to_string(),
            description: String::new(),
            default_decision: DecisionKind::Deny,
            rules: vec![PermissionRule::new("fs", "[read", "*", DecisionKind::Allow)],
            quality_gates: Vec::new(),
            termination: Vec::new(),
        }
        .compile()
        .expect_err("must fail");
        assert!(matches!(err, PolicyError::Pattern { index: 0, .. }));
    }

    #[test]
    fn invalid_gate_and_termination_are_rejected() {
        let mut raw = PolicyProfile {
            name: "gated".to_string(),
            description: String::new(),
            default_decision: DecisionKind::Deny,
            rules: Vec::new(),
            quality_gates: vec![QualityGate {
                name: "tests".to_string(),
                command: Vec::new(),
                timeout_secs: 10,
            }],
            termination: Vec::new(),
        };
        assert!(matches!(
            raw.clone().compile(),
            Err(PolicyError::Gate { .. })
        ));

        raw.quality_gates.clear();
        raw.termination = vec![TerminationCondition::MaxCost { usd: 0.0 }];
        assert!(matches!(raw.compile(), Err(PolicyError::Termination { .. })));
    }

    #[test]
    fn builtin_profiles_compile() {
        let names: Vec<String> = builtin_profiles()
            .into_iter()
            .map(|p| p.compile().expect("builtin compiles").name().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                PLAN_READONLY,
                HEADLESS_SAFE_SANDBOX,
                HEADLESS_PERMISSIVE_SANDBOX,
                TRUSTED_MOUNT_AUTONOMOUS
            ]
        );
    }

    #[test]
    fn readonly_profile_denies_writes() {
        let readonly = builtin_profiles()
            .into_iter()
            .find(|p| p.name == PLAN_READONLY)
            .expect("builtin")
            .compile()
            .expect("compile");
        assert_eq!(
            evaluate(&readonly, &ToolCall::new("grep", "search")).kind,
            DecisionKind::Allow
        );
        assert_eq!(
            evaluate(&readonly, &ToolCall::new("fs", "write").with_path("a.rs")).kind,
            DecisionKind::Deny
        );
    }

    #[test]
    fn safe_sandbox_denies_escaping_paths() {
        let safe = builtin_profiles()
            .into_iter()
            .find(|p| p.name == HEADLESS_SAFE_SANDBOX)
            .expect("builtin")
            .compile()
            .expect("compile");
        let inside = ToolCall::new("edit", "replace").with_path("src/main.rs");
        let outside = ToolCall::new("edit", "replace").with_path("/etc/hosts");
        let traversal = ToolCall::new("write", "create").with_path("src/../../x");
        assert_eq!(evaluate(&safe, &inside).kind, DecisionKind::Allow);
        assert_eq!(evaluate(&safe, &outside).kind, DecisionKind::Deny);
        assert_eq!(evaluate(&safe, &traversal).kind, DecisionKind::Deny);
        assert_eq!(
            evaluate(&safe, &ToolCall::new("shell", "exec")).kind,
            DecisionKind::Deny
        );
    }
}
