//! Property tests for permission policy evaluation.
//!
//! Rules are drawn from exact tool names and `*`, so the expected decision
//! can be computed independently as "first rule whose tool matches".

use orchestrator::core::policy::{
    DecisionKind, PermissionRule, PolicyProfile, builtin_profiles, evaluate,
};
use orchestrator::core::types::ToolCall;
use proptest::prelude::*;

fn decision_kind() -> impl Strategy<Value = DecisionKind> {
    prop_oneof![
        Just(DecisionKind::Allow),
        Just(DecisionKind::Deny),
        Just(DecisionKind::Ask),
    ]
}

fn tool_pattern() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => "[a-c]{1,2}",
        1 => Just("*".to_string()),
    ]
}

fn rules() -> impl Strategy<Value = Vec<(String, DecisionKind)>> {
    prop::collection::vec((tool_pattern(), decision_kind()), 0..8)
}

fn profile(default_decision: DecisionKind, rules: &[(String, DecisionKind)]) -> PolicyProfile {
    PolicyProfile {
        name: "generated".to_string(),
        description: String::new(),
        default_decision,
        rules: rules
            .iter()
            .map(|(tool, decision)| PermissionRule::new(tool, "*", "*", *decision))
            .collect(),
        quality_gates: Vec::new(),
        termination: Vec::new(),
    }
}

proptest! {
    #[test]
    fn first_matching_rule_decides(
        default_decision in decision_kind(),
        rules in rules(),
        tool in "[a-c]{1,2}",
        path in proptest::option::of("[a-z/]{0,12}"),
    ) {
        let compiled = profile(default_decision, &rules).compile().unwrap();
        let mut call = ToolCall::new(tool.clone(), "run");
        if let Some(path) = path {
            call = call.with_path(path);
        }

        let expected = rules
            .iter()
            .position(|(pattern, _)| pattern == "*" || *pattern == tool);
        let decision = evaluate(&compiled, &call);

        prop_assert_eq!(decision.rule_index, expected);
        let expected_kind = expected.map_or(default_decision, |i| rules[i].1);
        prop_assert_eq!(decision.kind, expected_kind);
    }

    #[test]
    fn evaluation_is_deterministic(
        rules in rules(),
        tool in "[a-d]{1,3}",
        action in "[a-z]{1,6}",
    ) {
        let compiled = profile(DecisionKind::Ask, &rules).compile().unwrap();
        let call = ToolCall::new(tool, action);
        let first = evaluate(&compiled, &call);
        for _ in 0..3 {
            prop_assert_eq!(evaluate(&compiled, &call), first);
        }
    }

    #[test]
    fn builtin_profiles_never_panic(
        tool in "[a-z]{1,8}",
        action in "[a-z]{1,8}",
        path in "[a-zA-Z0-9./~_-]{0,24}",
    ) {
        for profile in builtin_profiles() {
            let compiled = profile.compile().unwrap();
            let decision = evaluate(&compiled, &ToolCall::new(tool.clone(), action.clone()).with_path(path.clone()));
            if let Some(index) = decision.rule_index {
                prop_assert!(index < compiled.profile().rules.len());
            }
        }
    }
}

#[test]
fn git_internals_are_denied_by_the_permissive_profile() {
    let permissive = builtin_profiles()
        .into_iter()
        .find(|p| p.name == "headless-permissive-sandbox")
        .unwrap()
        .compile()
        .unwrap();
    let call = ToolCall::new("fs", "write").with_path(".git/config");
    let decision = evaluate(&permissive, &call);
    assert_eq!(decision.kind, DecisionKind::Deny);
    assert_eq!(decision.rule_index, Some(0));
}
