//! Lowers a linted [`crate::ast::Document`] into the flat [`crate::ir::PolicySet`]
//! the LSM engines and MITM proxy evaluate at runtime.

use crate::ast::CmpOp;
use crate::ast::ConditionKind;
use crate::ast::Document;
use crate::ast::Effect;
use crate::ast::EntityRef;
use crate::ast::Expr;
use crate::ast::Policy;
use crate::ir::HeaderRewriteRule;
use crate::ir::McpAction;
use crate::ir::McpRule;
use crate::ir::Operation;
use crate::ir::PolicyRule;
use crate::ir::PolicySet;
use crate::ir::RuleEffect;
use crate::lint::ActionKind;
use crate::lint::ResourceKind;
use crate::lint::resolve_action_kind;
use crate::lint::resolve_resource_kind;

pub struct Transpiled {
    pub policy_set: PolicySet,
    pub header_rewrites: Vec<HeaderRewriteRule>,
}

pub fn transpile(doc: &Document) -> Transpiled {
    let mut policy_set = PolicySet::default();
    let mut header_rewrites = Vec::new();

    for policy in &doc.policies {
        let Some(entity) = policy.action.entity.as_ref() else { continue };
        let Some(action_kind) = resolve_action_kind(entity) else { continue };
        let effect = match policy.effect {
            Effect::Permit => RuleEffect::Allow,
            Effect::Forbid => RuleEffect::Deny,
        };

        match action_kind {
            ActionKind::FileOpen => emit_file_rules(policy, effect, Operation::Open, &mut policy_set),
            ActionKind::FileOpenRo => emit_file_rules(policy, effect, Operation::OpenRo, &mut policy_set),
            ActionKind::FileOpenRw => emit_file_rules(policy, effect, Operation::OpenRw, &mut policy_set),
            ActionKind::ProcessExec => emit_exec_rules(policy, effect, &mut policy_set),
            ActionKind::NetworkConnect => emit_connect_rules(policy, effect, &mut policy_set),
            ActionKind::McpCall => emit_mcp_rules(policy, effect, &mut policy_set),
            ActionKind::HttpRewrite => emit_header_rewrite(policy, &mut header_rewrites),
        }
    }

    policy_set.sort_rules();
    policy_set.derive_connect_default();

    Transpiled { policy_set, header_rewrites }
}

/// Resources named directly in `resource in [...]`, plus any additionally
/// named in a `when { resource in [...] }` condition.
fn resource_entities(policy: &Policy) -> Vec<EntityRef> {
    let mut out: Vec<EntityRef> = policy.resource.entities.clone().unwrap_or_default();
    for cond in &policy.conditions {
        if cond.kind != ConditionKind::When {
            continue;
        }
        collect_resource_in(&cond.expr, &mut out);
    }
    out
}

fn collect_resource_in(expr: &Expr, out: &mut Vec<EntityRef>) {
    match expr {
        Expr::And(terms) => {
            for term in terms {
                collect_resource_in(term, out);
            }
        }
        Expr::ResourceIn(entities) => out.extend(entities.iter().cloned()),
        _ => {}
    }
}

/// `context.hostname` comparisons from `when` blocks, used when the
/// resource clause is bare but a connect rule still needs a concrete or
/// pattern hostname target.
fn hostname_conditions(policy: &Policy) -> Vec<(CmpOp, String)> {
    let mut out = Vec::new();
    for cond in &policy.conditions {
        if cond.kind != ConditionKind::When {
            continue;
        }
        collect_hostname_cmp(&cond.expr, &mut out);
    }
    out
}

fn collect_hostname_cmp(expr: &Expr, out: &mut Vec<(CmpOp, String)>) {
    match expr {
        Expr::And(terms) => {
            for term in terms {
                collect_hostname_cmp(term, out);
            }
        }
        Expr::ContextCmp { key, op, value } if key == "hostname" => out.push((*op, value.clone())),
        _ => {}
    }
}

fn header_conditions(policy: &Policy) -> (Option<String>, Option<String>) {
    let mut header = None;
    let mut value = None;
    for cond in &policy.conditions {
        if cond.kind != ConditionKind::When {
            continue;
        }
        collect_header_value(&cond.expr, &mut header, &mut value);
    }
    (header, value)
}

fn collect_header_value(expr: &Expr, header: &mut Option<String>, value: &mut Option<String>) {
    match expr {
        Expr::And(terms) => {
            for term in terms {
                collect_header_value(term, header, value);
            }
        }
        Expr::ContextCmp { key, value: v, .. } if key == "header" => *header = Some(v.clone()),
        Expr::ContextCmp { key, value: v, .. } if key == "value" => *value = Some(v.clone()),
        _ => {}
    }
}

fn emit_file_rules(policy: &Policy, effect: RuleEffect, op: Operation, policy_set: &mut PolicySet) {
    for entity in resource_entities(policy) {
        match resolve_resource_kind(&entity) {
            ResourceKind::File => policy_set.open.push(PolicyRule::file(effect, op, entity.id, false)),
            ResourceKind::Directory => policy_set.open.push(PolicyRule::file(effect, op, normalize_dir(&entity.id), true)),
            _ => {}
        }
    }
}

fn emit_exec_rules(policy: &Policy, effect: RuleEffect, policy_set: &mut PolicySet) {
    for entity in resource_entities(policy) {
        if resolve_resource_kind(&entity) == ResourceKind::File {
            policy_set.exec.push(PolicyRule::file(effect, Operation::Exec, entity.id, false));
        }
    }
}

fn normalize_dir(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

fn emit_connect_rules(policy: &Policy, effect: RuleEffect, policy_set: &mut PolicySet) {
    let mut hostnames: Vec<String> = Vec::new();

    for entity in resource_entities(policy) {
        match resolve_resource_kind(&entity) {
            ResourceKind::Host => hostnames.push(entity.id),
            ResourceKind::DnsZone => hostnames.push(format!("*.{}", entity.id)),
            _ => {}
        }
    }

    if hostnames.is_empty() {
        for (op, value) in hostname_conditions(policy) {
            hostnames.push(match op {
                CmpOp::Like => value,
                CmpOp::Equals => value,
            });
        }
    }

    for hostname in hostnames {
        policy_set.connect.push(host_to_connect_rule(effect, &hostname));
    }
}

fn host_to_connect_rule(effect: RuleEffect, raw: &str) -> PolicyRule {
    let (host_part, port) = match raw.rsplit_once(':') {
        Some((h, p)) if !h.is_empty() && p.parse::<u16>().is_ok() => (h, p.parse::<u16>().unwrap_or(0)),
        _ => (raw, 0u16),
    };

    if host_part == "*" {
        return PolicyRule::connect(effect, 0, port, "*".to_string(), true);
    }

    if let Some(ip) = parse_ipv4(host_part) {
        return PolicyRule::connect(effect, ip, port, String::new(), false);
    }

    if let Some(suffix) = host_part.strip_prefix("*.") {
        return PolicyRule::connect(effect, 0, port, suffix.to_string(), true);
    }

    PolicyRule::connect(effect, 0, port, host_part.to_string(), false)
}

fn parse_ipv4(s: &str) -> Option<u32> {
    let parts: Vec<&str> = s.split('.').collect();
    if parts.len() != 4 {
        return None;
    }
    let mut octets = [0u8; 4];
    for (i, part) in parts.iter().enumerate() {
        octets[i] = part.parse::<u8>().ok()?;
    }
    Some(u32::from_be_bytes(octets))
}

fn emit_mcp_rules(policy: &Policy, effect: RuleEffect, policy_set: &mut PolicySet) {
    let entities = resource_entities(policy);
    let servers: Vec<&str> = entities
        .iter()
        .filter(|e| resolve_resource_kind(e) == ResourceKind::McpServer)
        .map(|e| e.id.as_str())
        .collect();
    let tools: Vec<&str> = entities
        .iter()
        .filter(|e| resolve_resource_kind(e) == ResourceKind::McpTool)
        .map(|e| e.id.as_str())
        .collect();

    let servers = if servers.is_empty() { vec![""] } else { servers };
    let tools = if tools.is_empty() { vec![""] } else { tools };

    match effect {
        RuleEffect::Allow => {
            for server in &servers {
                for tool in &tools {
                    policy_set.mcp.push(McpRule {
                        action: McpAction::Allow,
                        server: server.to_string(),
                        tool: tool.to_string(),
                    });
                }
            }
        }
        RuleEffect::Deny => {
            for server in &servers {
                if !server.is_empty() {
                    policy_set.connect.push(host_to_connect_rule(RuleEffect::Deny, server));
                }
                for tool in &tools {
                    policy_set.mcp.push(McpRule {
                        action: McpAction::Deny,
                        server: server.to_string(),
                        tool: tool.to_string(),
                    });
                }
            }
        }
    }
}

fn emit_header_rewrite(policy: &Policy, header_rewrites: &mut Vec<HeaderRewriteRule>) {
    if policy.effect != Effect::Permit {
        return;
    }
    let Some(host) = resource_entities(policy)
        .into_iter()
        .find(|e| resolve_resource_kind(e) == ResourceKind::Host)
        .map(|e| e.id)
    else {
        return;
    };
    let (header, value) = header_conditions(policy);
    if let (Some(header), Some(value)) = (header, value) {
        header_rewrites.push(HeaderRewriteRule { host, header, value });
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::parser::parse;

    #[test]
    fn file_open_resources_become_open_rules() {
        let doc = parse(r#"permit(principal, action == Action::"FileOpen", resource in [File::"/etc/passwd", File::"/etc/hosts"]);"#).unwrap();
        let t = transpile(&doc);
        assert_eq!(t.policy_set.open.len(), 2);
        assert!(t.policy_set.open.iter().all(|r| r.effect == RuleEffect::Allow));
    }

    #[test]
    fn directory_resource_gets_trailing_slash_normalized() {
        let doc = parse(r#"permit(principal, action == Action::"FileOpen", resource in [Fs::Directory::"/tmp"]);"#).unwrap();
        let t = transpile(&doc);
        assert_eq!(t.policy_set.open[0].path, "/tmp/");
        assert!(t.policy_set.open[0].is_directory);
    }

    #[test]
    fn wildcard_connect_default_is_derived() {
        let doc = parse(r#"forbid(principal, action == Action::"NetworkConnect", resource in [Host::"*"]);"#).unwrap();
        let t = transpile(&doc);
        assert!(!t.policy_set.connect_default_allow);
        assert!(t.policy_set.connect_default_explicit);
    }

    #[test]
    fn ipv4_host_sets_dest_ip4_not_hostname() {
        let doc = parse(r#"permit(principal, action == Action::"NetworkConnect", resource in [Host::"93.184.216.34"]);"#).unwrap();
        let t = transpile(&doc);
        let rule = &t.policy_set.connect[0];
        assert_ne!(rule.dest_ip4, 0);
        assert!(rule.hostname.is_empty());
    }

    #[test]
    fn wildcard_subdomain_host_sets_is_wildcard() {
        let doc = parse(r#"permit(principal, action == Action::"NetworkConnect", resource in [Host::"*.example.com"]);"#).unwrap();
        let t = transpile(&doc);
        let rule = &t.policy_set.connect[0];
        assert!(rule.is_wildcard);
        assert_eq!(rule.hostname, "example.com");
    }

    #[test]
    fn mcp_permit_is_recorded_as_allow() {
        let doc = parse(r#"permit(principal, action == Action::"McpCall", resource in [MCP::Server::"github"]);"#).unwrap();
        let t = transpile(&doc);
        assert_eq!(t.policy_set.mcp.len(), 1);
        assert_eq!(t.policy_set.mcp[0].action, McpAction::Allow);
        assert_eq!(t.policy_set.mcp[0].server, "github");
    }

    #[test]
    fn mcp_forbid_emits_connect_deny_and_tool_denials() {
        let doc = parse(
            r#"forbid(principal, action == Action::"McpCall", resource in [MCP::Server::"github", MCP::Tool::"delete_repo"]);"#,
        )
        .unwrap();
        let t = transpile(&doc);
        assert!(t.policy_set.connect.iter().any(|r| r.hostname == "github" && r.effect == RuleEffect::Deny));
        assert!(t.policy_set.mcp.iter().any(|r| r.server == "github" && r.tool == "delete_repo" && r.action == McpAction::Deny));
    }

    #[test]
    fn http_rewrite_extracts_header_and_value() {
        let doc = parse(
            r#"permit(principal, action == Action::"HttpRewrite", resource in [Host::"example.com"]) when { context.header == "Authorization" && context.value == "Bearer xyz" };"#,
        )
        .unwrap();
        let t = transpile(&doc);
        assert_eq!(t.header_rewrites.len(), 1);
        assert_eq!(t.header_rewrites[0].host, "example.com");
        assert_eq!(t.header_rewrites[0].header, "Authorization");
        assert_eq!(t.header_rewrites[0].value, "Bearer xyz");
    }

    #[test]
    fn bare_resource_with_hostname_condition_becomes_connect_target() {
        let doc = parse(
            r#"forbid(principal, action == Action::"NetworkConnect", resource) when { context.hostname like "*.evil.example" };"#,
        )
        .unwrap();
        let t = transpile(&doc);
        assert_eq!(t.policy_set.connect.len(), 1);
        assert!(t.policy_set.connect[0].is_wildcard);
        assert_eq!(t.policy_set.connect[0].hostname, "evil.example");
    }
}
