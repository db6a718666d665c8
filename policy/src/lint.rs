//! Static checks over a parsed [`crate::ast::Document`], run before
//! transpilation. Every issue is attributed to the policy it came from and
//! carries a stable `code` so callers can filter/triage programmatically.

use crate::ast::ActionClause;
use crate::ast::CmpOp;
use crate::ast::ConditionKind;
use crate::ast::Document;
use crate::ast::Effect;
use crate::ast::EntityRef;
use crate::ast::Expr;
use crate::ast::Policy;
use crate::ast::PrincipalClause;
use crate::ir::MAX_HOSTNAME_LEN;
use crate::ir::MAX_PATH_LEN;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintIssue {
    pub policy_id: String,
    pub severity: Severity,
    pub code: &'static str,
    pub message: String,
}

impl LintIssue {
    fn new(policy_id: &str, severity: Severity, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            policy_id: policy_id.to_string(),
            severity,
            code,
            message: message.into(),
        }
    }
}

/// The supported canonical action kinds. `HttpRewrite` is reachable either
/// via `action == Action::"HttpRewrite"` (case-insensitive) or via the
/// entity shape `Http::ApplyRewrite`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    FileOpen,
    FileOpenRo,
    FileOpenRw,
    ProcessExec,
    NetworkConnect,
    McpCall,
    HttpRewrite,
}

pub fn resolve_action_kind(entity: &EntityRef) -> Option<ActionKind> {
    if entity.ty.eq_ignore_ascii_case("http::applyrewrite") {
        return Some(ActionKind::HttpRewrite);
    }
    if !entity.ty.eq_ignore_ascii_case("action") {
        return None;
    }
    match entity.id.to_ascii_lowercase().as_str() {
        "fileopen" => Some(ActionKind::FileOpen),
        "fileopenreadonly" => Some(ActionKind::FileOpenRo),
        "fileopenreadwrite" => Some(ActionKind::FileOpenRw),
        "processexec" => Some(ActionKind::ProcessExec),
        "networkconnect" => Some(ActionKind::NetworkConnect),
        "mcpcall" => Some(ActionKind::McpCall),
        "httprewrite" => Some(ActionKind::HttpRewrite),
        _ => None,
    }
}

/// Resource entity kinds after mapping from raw Cedar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    File,
    Directory,
    Host,
    DnsZone,
    IpRange,
    McpServer,
    McpTool,
    Unknown,
}

pub fn resolve_resource_kind(entity: &EntityRef) -> ResourceKind {
    match entity.ty.as_str() {
        "File" => ResourceKind::File,
        "Fs::Directory" => ResourceKind::Directory,
        "Host" | "Net::Hostname" | "Net::Endpoint" => ResourceKind::Host,
        "Net::DnsZone" => ResourceKind::DnsZone,
        "Net::IpRange" => ResourceKind::IpRange,
        "MCP::Server" => ResourceKind::McpServer,
        "MCP::Tool" => ResourceKind::McpTool,
        _ => ResourceKind::Unknown,
    }
}

pub fn lint(doc: &Document) -> Vec<LintIssue> {
    let mut issues = Vec::new();
    for policy in &doc.policies {
        lint_policy(policy, &mut issues);
        issues.extend(mcp_allow_noop_issue(policy));
    }
    dedup(&mut issues);
    issues
}

fn lint_policy(policy: &Policy, issues: &mut Vec<LintIssue>) {
    let id = &policy.id;

    if policy.principal == PrincipalClause::Constrained {
        issues.push(LintIssue::new(
            id,
            Severity::Warning,
            "unsupported_principal",
            "principal clauses other than bare `principal` are not supported",
        ));
    }

    let action_kind = lint_action(policy, issues);

    lint_resources(policy, action_kind, issues);

    for cond in &policy.conditions {
        lint_condition(id, cond.kind, &cond.expr, issues);
    }
}

fn lint_action(policy: &Policy, issues: &mut Vec<LintIssue>) -> Option<ActionKind> {
    let id = &policy.id;
    let ActionClause { entity, non_canonical } = &policy.action;

    let Some(entity) = entity else {
        issues.push(LintIssue::new(
            id,
            Severity::Error,
            "missing_action",
            "policy has no action clause; every policy must name a single action",
        ));
        return None;
    };

    if *non_canonical {
        issues.push(LintIssue::new(
            id,
            Severity::Error,
            "unsupported_action_syntax",
            format!("action clause uses an unsupported shape (expected `action == Action::\"X\"`), read first entity {:?}", entity),
        ));
    }

    match resolve_action_kind(entity) {
        Some(kind) => Some(kind),
        None => {
            issues.push(LintIssue::new(
                id,
                Severity::Error,
                "unsupported_action_id",
                format!("unrecognized action id `{}::\"{}\"`", entity.ty, entity.id),
            ));
            None
        }
    }
}

fn lint_resources(policy: &Policy, action_kind: Option<ActionKind>, issues: &mut Vec<LintIssue>) {
    let id = &policy.id;
    let Some(entities) = policy.resource.entities.as_ref() else {
        // Bare `resource` is only meaningful when a `when { resource in [...] }`
        // or `context.hostname` condition supplies the actual target; that is
        // checked separately by the transpiler. Bare resource with no such
        // condition and no action at all is still flagged.
        if action_kind.is_none() {
            issues.push(LintIssue::new(id, Severity::Error, "no_resources", "policy resolves no resources"));
        }
        return;
    };

    if entities.is_empty() {
        issues.push(LintIssue::new(id, Severity::Error, "no_resources", "`resource in [...]` list is empty"));
        return;
    }

    for entity in entities {
        lint_one_resource(id, action_kind, entity, issues);
    }
}

fn lint_one_resource(id: &str, action_kind: Option<ActionKind>, entity: &EntityRef, issues: &mut Vec<LintIssue>) {
    let kind = resolve_resource_kind(entity);

    match kind {
        ResourceKind::IpRange => {
            issues.push(LintIssue::new(
                id,
                Severity::Error,
                "cidr_unsupported",
                format!("Net::IpRange resource `{}` is not supported; use a hostname or the proxy", entity.id),
            ));
            return;
        }
        ResourceKind::Unknown => {
            issues.push(LintIssue::new(
                id,
                Severity::Error,
                "resource_action_mismatch",
                format!("unrecognized resource type `{}`", entity.ty),
            ));
            return;
        }
        _ => {}
    }

    if let Some(action_kind) = action_kind {
        let mismatch = match (action_kind, kind) {
            (ActionKind::FileOpen | ActionKind::FileOpenRo | ActionKind::FileOpenRw, ResourceKind::File | ResourceKind::Directory) => false,
            (ActionKind::ProcessExec, ResourceKind::File) => false,
            (ActionKind::NetworkConnect, ResourceKind::Host | ResourceKind::DnsZone) => false,
            (ActionKind::McpCall, ResourceKind::McpServer | ResourceKind::McpTool) => false,
            (ActionKind::HttpRewrite, ResourceKind::Host) => false,
            _ => true,
        };
        if mismatch {
            if matches!(kind, ResourceKind::McpServer | ResourceKind::McpTool) {
                issues.push(LintIssue::new(
                    id,
                    Severity::Warning,
                    "mcp_resource_without_mcp_call",
                    format!("MCP resource `{}::\"{}\"` is ignored because the action is not McpCall", entity.ty, entity.id),
                ));
            } else {
                issues.push(LintIssue::new(
                    id,
                    Severity::Error,
                    "resource_action_mismatch",
                    format!("resource type `{}` does not match action {:?}", entity.ty, action_kind),
                ));
            }
            return;
        }
    }

    match kind {
        ResourceKind::File => lint_path(id, &entity.id, false, issues),
        ResourceKind::Directory => lint_path(id, &entity.id, true, issues),
        ResourceKind::Host => lint_hostname(id, &entity.id, issues),
        ResourceKind::DnsZone => {
            lint_hostname(id, &entity.id, issues);
            issues.push(LintIssue::new(
                id,
                Severity::Warning,
                "dnszone_apex_excluded",
                format!("Net::DnsZone `{}` matches only its subdomains; the zone apex itself is excluded", entity.id),
            ));
        }
        _ => {}
    }
}

fn lint_path(id: &str, path: &str, is_directory: bool, issues: &mut Vec<LintIssue>) {
    if path.len() > MAX_PATH_LEN {
        issues.push(LintIssue::new(
            id,
            Severity::Error,
            "path_too_long",
            format!("path `{path}` exceeds the maximum length of {MAX_PATH_LEN} bytes"),
        ));
    }
    if is_directory && !path.ends_with('/') {
        issues.push(LintIssue::new(
            id,
            Severity::Warning,
            "directory_missing_trailing_slash",
            format!("directory resource `{path}` should end with `/`"),
        ));
    }
    if let Some(rest) = path.strip_suffix('*') {
        if rest.contains('*') {
            issues.push(LintIssue::new(id, Severity::Error, "non_prefix_wildcard", format!("path `{path}` has a wildcard outside the trailing position")));
        }
    } else if path.contains('*') {
        issues.push(LintIssue::new(id, Severity::Error, "non_prefix_wildcard", format!("path `{path}` has a wildcard outside the trailing position")));
    }
}

fn lint_hostname(id: &str, hostname: &str, issues: &mut Vec<LintIssue>) {
    if hostname.len() > MAX_HOSTNAME_LEN {
        issues.push(LintIssue::new(
            id,
            Severity::Error,
            "host_too_long",
            format!("hostname `{hostname}` exceeds the maximum length of {MAX_HOSTNAME_LEN} bytes"),
        ));
    }
    if hostname.contains(':') && hostname.contains("::") {
        issues.push(LintIssue::new(id, Severity::Error, "ipv6_literal", format!("IPv6 literal `{hostname}` is not supported as a connect resource")));
    }
    if let Some((host_part, port_part)) = hostname.rsplit_once(':') {
        if !host_part.is_empty() && port_part.parse::<u16>().is_err() {
            issues.push(LintIssue::new(id, Severity::Error, "invalid_port", format!("`{hostname}` has an invalid port suffix")));
        }
    }
    if hostname != "*" {
        if let Some(rest) = hostname.strip_prefix('*') {
            if rest.contains('*') {
                issues.push(LintIssue::new(id, Severity::Error, "non_prefix_wildcard", format!("hostname `{hostname}` has a wildcard outside the leading position")));
            }
        } else if hostname.contains('*') {
            issues.push(LintIssue::new(id, Severity::Error, "non_prefix_wildcard", format!("hostname `{hostname}` has a wildcard outside the leading position")));
        }
        let looks_like_ip = hostname.split('.').count() == 4
            && hostname.split('.').all(|p| p.parse::<u8>().is_ok());
        if !looks_like_ip {
            issues.push(LintIssue::new(
                id,
                Severity::Warning,
                "proxy_recommended",
                format!("hostname-based connect rule `{hostname}` requires the MITM proxy to resolve DNS at enforcement time"),
            ));
        }
    }
}

fn lint_condition(id: &str, kind: ConditionKind, expr: &Expr, issues: &mut Vec<LintIssue>) {
    if kind == ConditionKind::Unless {
        issues.push(LintIssue::new(id, Severity::Error, "unless_block", "`unless` blocks are not supported"));
        return;
    }
    lint_expr(id, expr, issues);
}

fn lint_expr(id: &str, expr: &Expr, issues: &mut Vec<LintIssue>) {
    match expr {
        Expr::And(terms) => {
            for term in terms {
                lint_expr(id, term, issues);
            }
        }
        Expr::ResourceIn(_) => {}
        Expr::ContextCmp { key, op, .. } => {
            if key != "hostname" && key != "header" && key != "value" {
                issues.push(LintIssue::new(
                    id,
                    Severity::Error,
                    "unsupported_condition",
                    format!("unsupported context key `{key}`"),
                ));
            }
            if *op == CmpOp::Like && key != "hostname" {
                issues.push(LintIssue::new(
                    id,
                    Severity::Error,
                    "unsupported_condition",
                    format!("`like` is only supported on `context.hostname`, not `context.{key}`"),
                ));
            }
        }
        Expr::Unsupported(raw) => {
            issues.push(LintIssue::new(id, Severity::Error, "unsupported_condition", format!("unsupported condition expression: {raw}")));
        }
    }
}

/// Emits an `mcp_allow_noop` warning for a `permit` policy targeting
/// `McpCall`: the rule is still recorded by the transpiler, but permitting
/// an MCP call is a no-op from an enforcement standpoint (deny-by-default
/// governs MCP access; there is nothing to additionally allow).
pub fn mcp_allow_noop_issue(policy: &Policy) -> Option<LintIssue> {
    if policy.effect != Effect::Permit {
        return None;
    }
    let entity = policy.action.entity.as_ref()?;
    if resolve_action_kind(entity) == Some(ActionKind::McpCall) {
        Some(LintIssue::new(
            &policy.id,
            Severity::Warning,
            "mcp_allow_noop",
            "permitting McpCall has no enforcement effect; the rule is recorded but ignored by consumers",
        ))
    } else {
        None
    }
}

fn dedup(issues: &mut Vec<LintIssue>) {
    let mut seen = std::collections::HashSet::new();
    issues.retain(|issue| seen.insert((issue.policy_id.clone(), issue.code, issue.message.clone())));
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::parser::parse;

    #[test]
    fn flags_missing_action() {
        let doc = parse(r#"permit(principal, action, resource in [File::"/a"]);"#).unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().any(|i| i.code == "missing_action"));
    }

    #[test]
    fn flags_cidr_unsupported() {
        let doc = parse(r#"permit(principal, action == Action::"NetworkConnect", resource in [Net::IpRange::"10.0.0.0/8"]);"#).unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().any(|i| i.code == "cidr_unsupported"));
    }

    #[test]
    fn flags_resource_action_mismatch() {
        let doc = parse(r#"permit(principal, action == Action::"NetworkConnect", resource in [File::"/a"]);"#).unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().any(|i| i.code == "resource_action_mismatch"));
    }

    #[test]
    fn flags_path_too_long() {
        let long_path = format!("/{}", "a".repeat(300));
        let src = format!(r#"permit(principal, action == Action::"FileOpen", resource in [File::"{long_path}"]);"#);
        let doc = parse(&src).unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().any(|i| i.code == "path_too_long"));
    }

    #[test]
    fn flags_directory_missing_trailing_slash() {
        let doc = parse(r#"permit(principal, action == Action::"FileOpen", resource in [Fs::Directory::"/tmp"]);"#).unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().any(|i| i.code == "directory_missing_trailing_slash"));
    }

    #[test]
    fn flags_unless_block() {
        let doc = parse(
            r#"permit(principal, action == Action::"NetworkConnect", resource in [Host::"example.com"]) unless { resource in [Host::"example.com"] };"#,
        )
        .unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().any(|i| i.code == "unless_block"));
    }

    #[test]
    fn no_issues_for_clean_policy() {
        let doc = parse(r#"permit(principal, action == Action::"FileOpen", resource in [File::"/etc/passwd"]);"#).unwrap();
        let issues = lint(&doc);
        assert!(issues.iter().all(|i| i.severity == Severity::Warning), "{issues:?}");
    }

    #[test]
    fn mcp_resource_without_mcp_call_is_warning() {
        let doc = parse(r#"permit(principal, action == Action::"FileOpen", resource in [MCP::Server::"github"]);"#).unwrap();
        let issues = lint(&doc);
        let issue = issues.iter().find(|i| i.code == "mcp_resource_without_mcp_call").unwrap();
        assert_eq!(issue.severity, Severity::Warning);
    }
}
