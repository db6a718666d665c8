//! The process-exec enforcement point. Structurally similar to
//! [`crate::engines::open`] but deliberately has no duplicate suppression
//! window: each `execve` the kernel reports is a distinct process lifecycle
//! event, not a hook that can legitimately fire twice for the same action.

use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use leash_policy::ir::PolicyRule;
use leash_policy::ir::RuleEffect;

use crate::backend::Engine;
use crate::backend::KernelBackend;
use crate::engines::open::match_path_rule;
use crate::error::LsmError;
use crate::event::ExecEvent;

pub const RULE_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct ExecDecision {
    pub event: ExecEvent,
    pub effect: RuleEffect,
}

pub struct ExecEngine<B: KernelBackend> {
    backend: Arc<B>,
    rules: RwLock<Vec<PolicyRule>>,
}

impl<B: KernelBackend> ExecEngine<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self { backend, rules: RwLock::new(Vec::new()) }
    }

    pub fn reconcile(&self, rules: Vec<PolicyRule>) -> Result<(), LsmError> {
        if rules.len() > RULE_CAPACITY {
            return Err(LsmError::TableFull { operation: "exec", capacity: RULE_CAPACITY });
        }
        self.backend.update_rules(Engine::Exec, &rules)?;
        *self.rules.write().expect("exec rule table lock poisoned") = rules;
        Ok(())
    }

    pub fn evaluate(&self, path: &str) -> RuleEffect {
        let rules = self.rules.read().expect("exec rule table lock poisoned");
        match_path_rule(&rules, path)
    }

    pub fn poll_decisions(&self) -> Result<Vec<ExecDecision>, LsmError> {
        let raw = self.backend.poll_events(Engine::Exec, Duration::from_millis(100))?;
        raw.into_iter()
            .map(|bytes| {
                let event = ExecEvent::decode(&bytes)?;
                let effect = self.evaluate(&event.path);
                Ok(ExecDecision { event, effect })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::backend::NullBackend;
    use leash_policy::ir::Operation;

    #[test]
    fn reconcile_rejects_oversized_table() {
        let engine = ExecEngine::new(Arc::new(NullBackend::new()));
        let rules: Vec<_> = (0..RULE_CAPACITY + 1)
            .map(|i| PolicyRule::file(RuleEffect::Allow, Operation::Exec, format!("/bin/{i}"), false))
            .collect();
        let err = engine.reconcile(rules).unwrap_err();
        assert!(matches!(err, LsmError::TableFull { .. }));
    }

    #[test]
    fn evaluates_against_reconciled_rules() {
        let engine = ExecEngine::new(Arc::new(NullBackend::new()));
        engine
            .reconcile(vec![PolicyRule::file(RuleEffect::Deny, Operation::Exec, "/bin/sh".to_string(), false)])
            .unwrap();
        assert_eq!(engine.evaluate("/bin/sh"), RuleEffect::Deny);
        assert_eq!(engine.evaluate("/bin/ls"), RuleEffect::Deny);
    }
}
