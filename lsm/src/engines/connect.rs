//! The network-connect enforcement point. Unlike open/exec, a connect rule
//! may be keyed by IPv4 literal or by hostname, and hostname rules can only
//! be matched once the kernel's IP-only connect event is correlated with a
//! hostname the MITM proxy (or an upstream DNS observer) has already
//! resolved — hence the `hostname_cache` callers feed via
//! [`ConnectEngine::note_dns_resolution`].

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use leash_policy::ir::PolicyRule;
use leash_policy::ir::PolicySet;
use leash_policy::ir::RuleEffect;

use crate::backend::Engine;
use crate::backend::KernelBackend;
use crate::error::LsmError;
use crate::event::ConnectEvent;

pub const RULE_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct ConnectDecision {
    pub event: ConnectEvent,
    pub effect: RuleEffect,
    pub hostname: Option<String>,
}

pub struct ConnectEngine<B: KernelBackend> {
    backend: Arc<B>,
    rules: RwLock<Vec<PolicyRule>>,
    default_allow: RwLock<bool>,
    hostname_cache: RwLock<HashMap<u32, String>>,
}

impl<B: KernelBackend> ConnectEngine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            rules: RwLock::new(Vec::new()),
            default_allow: RwLock::new(false),
            hostname_cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn reconcile(&self, policy_set: &PolicySet) -> Result<(), LsmError> {
        if policy_set.connect.len() > RULE_CAPACITY {
            return Err(LsmError::TableFull { operation: "connect", capacity: RULE_CAPACITY });
        }
        self.backend.update_rules(Engine::Connect, &policy_set.connect)?;
        self.backend.set_connect_default(policy_set.connect_default_allow)?;
        *self.rules.write().expect("connect rule table lock poisoned") = policy_set.connect.clone();
        *self.default_allow.write().expect("connect default lock poisoned") = policy_set.connect_default_allow;
        Ok(())
    }

    /// Records that `ip4` was most recently resolved from `hostname`, so a
    /// later connect event to that address can be matched against
    /// hostname-keyed rules.
    pub fn note_dns_resolution(&self, ip4: u32, hostname: String) {
        self.hostname_cache.write().expect("hostname cache lock poisoned").insert(ip4, hostname);
    }

    pub fn evaluate(&self, ip4: u32, port: u16) -> (RuleEffect, Option<String>) {
        let rules = self.rules.read().expect("connect rule table lock poisoned");
        let hostname = self.hostname_cache.read().expect("hostname cache lock poisoned").get(&ip4).cloned();
        let default_allow = *self.default_allow.read().expect("connect default lock poisoned");
        let effect = match_connect_rule(&rules, ip4, port, hostname.as_deref(), default_allow);
        (effect, hostname)
    }

    pub fn poll_decisions(&self) -> Result<Vec<ConnectDecision>, LsmError> {
        let raw = self.backend.poll_events(Engine::Connect, Duration::from_millis(100))?;
        raw.into_iter()
            .map(|bytes| {
                let event = ConnectEvent::decode(&bytes)?;
                let (effect, hostname) = self.evaluate(event.dest_ip4, event.dest_port);
                Ok(ConnectDecision { event, effect, hostname })
            })
            .collect()
    }
}

/// IP-literal rules take precedence over hostname rules (an operator who
/// names a bare IP meant exactly that address); among hostname rules, an
/// exact match wins over a wildcard suffix match because `rules` is sorted
/// by descending hostname length. A wildcard rule matches only a
/// dot-aligned subdomain of non-zero length — `*.example.com` matches
/// `api.example.com` but not the zone apex `example.com` itself (see
/// `dnszone_apex_excluded` in the linter). A rule whose `dest_port` is `0`
/// matches any port. Falls back to `default_allow` when nothing matches.
pub fn match_connect_rule(rules: &[PolicyRule], ip4: u32, port: u16, hostname: Option<&str>, default_allow: bool) -> RuleEffect {
    for rule in rules {
        if rule.dest_ip4 != 0 {
            if rule.dest_ip4 == ip4 && (rule.dest_port == 0 || rule.dest_port == port) {
                return rule.effect;
            }
            continue;
        }
        if rule.hostname == "*" {
            continue; // handled by default_allow/connect_default_explicit, not a per-connection match
        }
        if let Some(host) = hostname {
            let port_matches = rule.dest_port == 0 || rule.dest_port == port;
            if !port_matches {
                continue;
            }
            if rule.is_wildcard {
                if host.ends_with(&format!(".{}", rule.hostname)) {
                    return rule.effect;
                }
            } else if host == rule.hostname {
                return rule.effect;
            }
        }
    }
    if default_allow { RuleEffect::Allow } else { RuleEffect::Deny }
}
