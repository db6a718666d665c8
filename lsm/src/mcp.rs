//! Evaluates MCP tool-call rules extracted from policy. This is a pure,
//! in-process lookup — unlike the three kernel engines, MCP enforcement
//! happens in the MITM proxy when it parses a JSON-RPC `tools/call`
//! request, so there's no ring buffer or kernel rule table involved.

use leash_policy::ir::McpAction;
use leash_policy::ir::McpRule;
use leash_policy::ir::RuleEffect;

/// Empty `server`/`tool` on a rule act as wildcards; matching is
/// case-insensitive on both fields. A matching deny always wins over a
/// matching allow for the same (server, tool) pair, regardless of rule
/// order. Absent any matching rule, the call is allowed: enforcing MCP
/// `allow` is informational only in v1 (see spec §1 Non-goals), so the
/// default must not 403 every call under a policy that never mentions
/// MCP at all.
pub struct McpChecker {
    rules: Vec<McpRule>,
}

impl McpChecker {
    pub fn new(rules: Vec<McpRule>) -> Self {
        Self { rules }
    }

    pub fn set_rules(&mut self, rules: Vec<McpRule>) {
        self.rules = rules;
    }

    pub fn evaluate(&self, server: &str, tool: &str) -> RuleEffect {
        for rule in &self.rules {
            if !field_matches(&rule.server, server) || !field_matches(&rule.tool, tool) {
                continue;
            }
            if rule.action == McpAction::Deny {
                return RuleEffect::Deny;
            }
        }
        RuleEffect::Allow
    }
}

fn field_matches(rule_value: &str, observed: &str) -> bool {
    rule_value.is_empty() || rule_value.eq_ignore_ascii_case(observed)
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    fn rule(action: McpAction, server: &str, tool: &str) -> McpRule {
        McpRule { action, server: server.to_string(), tool: tool.to_string() }
    }

    #[test]
    fn default_is_allow() {
        let checker = McpChecker::new(vec![]);
        assert_eq!(checker.evaluate("github", "delete_repo"), RuleEffect::Allow);
    }

    #[test]
    fn explicit_deny_rule_denies_matching_calls() {
        let checker = McpChecker::new(vec![rule(McpAction::Deny, "github", "delete_repo")]);
        assert_eq!(checker.evaluate("github", "delete_repo"), RuleEffect::Deny);
        assert_eq!(checker.evaluate("github", "create_issue"), RuleEffect::Allow);
    }

    #[test]
    fn wildcard_server_allow_permits_any_tool() {
        let checker = McpChecker::new(vec![rule(McpAction::Allow, "github", "")]);
        assert_eq!(checker.evaluate("github", "create_issue"), RuleEffect::Allow);
        assert_eq!(checker.evaluate("gitlab", "create_issue"), RuleEffect::Allow);
    }

    #[test]
    fn deny_wins_over_allow_for_same_pair() {
        let checker = McpChecker::new(vec![
            rule(McpAction::Allow, "github", ""),
            rule(McpAction::Deny, "github", "delete_repo"),
        ]);
        assert_eq!(checker.evaluate("github", "create_issue"), RuleEffect::Allow);
        assert_eq!(checker.evaluate("github", "delete_repo"), RuleEffect::Deny);
    }

    #[test]
    fn matching_is_case_insensitive() {
        let checker = McpChecker::new(vec![rule(McpAction::Allow, "GitHub", "Create_Issue")]);
        assert_eq!(checker.evaluate("github", "create_issue"), RuleEffect::Allow);
    }
}
