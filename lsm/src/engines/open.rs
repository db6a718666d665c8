//! The file-open enforcement point: longest-path-wins matching over a rule
//! table of at most [`RULE_CAPACITY`] entries, with a short duplicate
//! suppression window so a single open() syscall that triggers several LSM
//! hook invocations (e.g. `security_file_open` plus an internal retry)
//! doesn't produce duplicate log lines.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;

use leash_policy::ir::PolicyRule;
use leash_policy::ir::RuleEffect;

use crate::backend::Engine;
use crate::backend::KernelBackend;
use crate::error::LsmError;
use crate::event::OpenEvent;

pub const RULE_CAPACITY: usize = 256;
const DUP_WINDOW: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct OpenDecision {
    pub event: OpenEvent,
    pub effect: RuleEffect,
}

type DupKey = (u32, u32, u64, i32, String);

pub struct OpenEngine<B: KernelBackend> {
    backend: Arc<B>,
    rules: RwLock<Vec<PolicyRule>>,
    recent: Mutex<HashMap<DupKey, Instant>>,
}

impl<B: KernelBackend> OpenEngine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            backend,
            rules: RwLock::new(Vec::new()),
            recent: Mutex::new(HashMap::new()),
        }
    }

    pub fn reconcile(&self, rules: Vec<PolicyRule>) -> Result<(), LsmError> {
        if rules.len() > RULE_CAPACITY {
            return Err(LsmError::TableFull { operation: "open", capacity: RULE_CAPACITY });
        }
        self.backend.update_rules(Engine::Open, &rules)?;
        *self.rules.write().expect("open rule table lock poisoned") = rules;
        Ok(())
    }

    pub fn evaluate(&self, path: &str) -> RuleEffect {
        let rules = self.rules.read().expect("open rule table lock poisoned");
        match_path_rule(&rules, path)
    }

    /// Drains pending kernel events, applying duplicate suppression and
    /// evaluating each surviving event against the current rule table.
    pub fn poll_decisions(&self) -> Result<Vec<OpenDecision>, LsmError> {
        let raw = self.backend.poll_events(Engine::Open, Duration::from_millis(100))?;
        let mut decisions = Vec::with_capacity(raw.len());
        for bytes in raw {
            let event = OpenEvent::decode(&bytes)?;
            if self.is_duplicate(&event) {
                continue;
            }
            let effect = self.evaluate(&event.path);
            decisions.push(OpenDecision { event, effect });
        }
        Ok(decisions)
    }

    fn is_duplicate(&self, event: &OpenEvent) -> bool {
        let key = (event.pid, event.tgid, event.cgroup_id, event.ret, event.path.clone());
        let mut recent = self.recent.lock().expect("dup suppression lock poisoned");
        let now = Instant::now();
        recent.retain(|_, seen_at| now.duration_since(*seen_at) < DUP_WINDOW);
        if recent.contains_key(&key) {
            return true;
        }
        recent.insert(key, now);
        false
    }
}

/// Longest-path-wins lookup: `rules` must already be sorted by descending
/// path length (see [`leash_policy::ir::PolicySet::sort_rules`]). Default
/// is deny when no rule matches.
pub fn match_path_rule(rules: &[PolicyRule], path: &str) -> RuleEffect {
    for rule in rules {
        if rule.is_directory {
            if path.starts_with(&rule.path) {
                return rule.effect;
            }
        } else if let Some(prefix) = rule.path.strip_suffix('*') {
            if path.starts_with(prefix) {
                return rule.effect;
            }
        } else if path == rule.path {
            return rule.effect;
        }
    }
    RuleEffect::Deny
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::backend::NullBackend;
    use leash_policy::ir::Operation;

    fn rule(effect: RuleEffect, path: &str, is_dir: bool) -> PolicyRule {
        PolicyRule::file(effect, Operation::Open, path.to_string(), is_dir)
    }

    #[test]
    fn more_specific_rule_wins() {
        let mut rules = vec![rule(RuleEffect::Allow, "/etc/", true), rule(RuleEffect::Deny, "/etc/shadow", false)];
        rules.sort_by_key(|r| std::cmp::Reverse(r.path.len()));
        assert_eq!(match_path_rule(&rules, "/etc/shadow"), RuleEffect::Deny);
        assert_eq!(match_path_rule(&rules, "/etc/hosts"), RuleEffect::Allow);
    }

    #[test]
    fn default_is_deny() {
        assert_eq!(match_path_rule(&[], "/anything"), RuleEffect::Deny);
    }

    #[test]
    fn reconcile_rejects_oversized_table() {
        let engine = OpenEngine::new(Arc::new(NullBackend::new()));
        let rules: Vec<_> = (0..RULE_CAPACITY + 1).map(|i| rule(RuleEffect::Allow, &format!("/tmp/{i}"), false)).collect();
        let err = engine.reconcile(rules).unwrap_err();
        assert!(matches!(err, LsmError::TableFull { .. }));
    }

    #[test]
    fn duplicate_events_within_window_are_suppressed() {
        let engine = OpenEngine::new(Arc::new(NullBackend::new()));
        let event = OpenEvent {
            pid: 1,
            tgid: 1,
            uid: 0,
            cgroup_id: 9,
            timestamp_ns: 0,
            flags: 0,
            ret: 0,
            path: "/etc/passwd".to_string(),
        };
        assert!(!engine.is_duplicate(&event));
        assert!(engine.is_duplicate(&event));
    }

    #[test]
    fn same_path_from_a_different_pid_is_not_suppressed() {
        let engine = OpenEngine::new(Arc::new(NullBackend::new()));
        let mut event = OpenEvent {
            pid: 1,
            tgid: 1,
            uid: 0,
            cgroup_id: 9,
            timestamp_ns: 0,
            flags: 0,
            ret: 0,
            path: "/etc/passwd".to_string(),
        };
        assert!(!engine.is_duplicate(&event));
        event.pid = 2;
        event.tgid = 2;
        assert!(!engine.is_duplicate(&event));
    }
}
