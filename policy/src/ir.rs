//! Runtime intermediate representation produced by the transpiler: the flat
//! rule tables the LSM engines and the MITM proxy actually evaluate.

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuleEffect {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Open,
    OpenRo,
    OpenRw,
    Exec,
    Connect,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Open => "open",
            Operation::OpenRo => "open:ro",
            Operation::OpenRw => "open:rw",
            Operation::Exec => "exec",
            Operation::Connect => "connect",
        }
    }
}

/// Maximum byte length of a file/exec path rule, per the kernel struct
/// layout's fixed `path[256]` buffer (255 usable bytes plus NUL).
pub const MAX_PATH_LEN: usize = 255;
/// Maximum byte length of a connect hostname rule, mirroring the kernel
/// struct layout's `hostname[128]` buffer.
pub const MAX_HOSTNAME_LEN: usize = 127;
/// Maximum number of argv matchers carried by an exec rule.
pub const MAX_ARGS: usize = 3;
/// Maximum byte length of a single argv matcher.
pub const MAX_ARG_LEN: usize = 31;

/// A single open/exec/connect rule. Only the fields relevant to its
/// `operation` are meaningful; the rest stay at their zero value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyRule {
    pub effect: RuleEffect,
    pub operation: Operation,

    // file / exec fields
    pub path: String,
    pub is_directory: bool,
    pub arg_count: u8,
    pub args: Vec<String>,

    // connect fields
    pub dest_ip4: u32,
    pub dest_port: u16,
    pub hostname: String,
    pub hostname_len: u16,
    pub is_wildcard: bool,
}

impl PolicyRule {
    pub fn file(effect: RuleEffect, operation: Operation, path: String, is_directory: bool) -> Self {
        Self {
            effect,
            operation,
            path,
            is_directory,
            arg_count: 0,
            args: Vec::new(),
            dest_ip4: 0,
            dest_port: 0,
            hostname: String::new(),
            hostname_len: 0,
            is_wildcard: false,
        }
    }

    pub fn connect(
        effect: RuleEffect,
        dest_ip4: u32,
        dest_port: u16,
        hostname: String,
        is_wildcard: bool,
    ) -> Self {
        let hostname_len = hostname.len() as u16;
        Self {
            effect,
            operation: Operation::Connect,
            path: String::new(),
            is_directory: false,
            arg_count: 0,
            args: Vec::new(),
            dest_ip4,
            dest_port,
            hostname,
            hostname_len,
            is_wildcard,
        }
    }

    /// Sort key for "longest, most specific rule first": path length for
    /// file/exec rules, hostname length for connect rules.
    fn specificity_len(&self) -> usize {
        match self.operation {
            Operation::Connect => self.hostname.len(),
            _ => self.path.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McpAction {
    Allow,
    Deny,
}

/// `server`/`tool` empty strings act as wildcards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct McpRule {
    pub action: McpAction,
    pub server: String,
    pub tool: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderRewriteRule {
    pub host: String,
    pub header: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicySet {
    pub open: Vec<PolicyRule>,
    pub exec: Vec<PolicyRule>,
    pub connect: Vec<PolicyRule>,
    pub mcp: Vec<McpRule>,
    pub connect_default_allow: bool,
    pub connect_default_explicit: bool,
}

impl PolicySet {
    /// Sorts open/exec by descending path length and connect by descending
    /// hostname length, stably (equal-length rules keep source order).
    pub fn sort_rules(&mut self) {
        self.open.sort_by_key(|r| std::cmp::Reverse(r.specificity_len()));
        self.exec.sort_by_key(|r| std::cmp::Reverse(r.specificity_len()));
        self.connect.sort_by_key(|r| std::cmp::Reverse(r.specificity_len()));
    }

    /// Derives the default connect posture from the rule set: scans for
    /// rules with `dest_ip4 == 0`, `dest_port == 0`, and `hostname == "*"`.
    /// A matching deny wins over a matching allow and marks the posture
    /// explicit; a matching allow with no deny marks it implicit.
    pub fn derive_connect_default(&mut self) {
        let is_wildcard_default = |r: &PolicyRule| {
            r.operation == Operation::Connect
                && r.dest_ip4 == 0
                && r.dest_port == 0
                && r.hostname == "*"
        };

        let has_deny = self
            .connect
            .iter()
            .any(|r| is_wildcard_default(r) && r.effect == RuleEffect::Deny);
        let has_allow = self
            .connect
            .iter()
            .any(|r| is_wildcard_default(r) && r.effect == RuleEffect::Allow);

        if has_deny {
            self.connect_default_allow = false;
            self.connect_default_explicit = true;
        } else if has_allow {
            self.connect_default_allow = true;
            self.connect_default_explicit = false;
        } else {
            self.connect_default_allow = false;
            self.connect_default_explicit = false;
        }
    }
}
