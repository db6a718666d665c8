//! Top-level coordinator: owns the three engines plus the cgroup
//! membership set and the MCP checker, and serializes rule-table
//! reconciliation behind a single guard so two concurrent policy reloads
//! can't interleave their per-engine writes.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;

use leash_policy::ir::PolicySet;
use leash_policy::ir::RuleEffect;

use crate::backend::KernelBackend;
use crate::engines::ConnectEngine;
use crate::engines::ExecEngine;
use crate::engines::OpenEngine;
use crate::error::LsmError;
use crate::mcp::McpChecker;

/// Prefixes that mark a file under a cgroup directory as a control file
/// rather than a task/process listing; used when walking `/sys/fs/cgroup`
/// to find the cgroups a workload actually belongs to.
pub const CGROUP_CONTROL_FILE_PREFIXES: &[&str] =
    &["cgroup.", "cpu.", "memory.", "io.", "pids.", "rdma.", "hugetlb.", "misc.", "irq."];

pub fn is_cgroup_control_file(name: &str) -> bool {
    CGROUP_CONTROL_FILE_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

pub struct LSMManager<B: KernelBackend> {
    backend: Arc<B>,
    open: OpenEngine<B>,
    exec: ExecEngine<B>,
    connect: ConnectEngine<B>,
    mcp: Mutex<McpChecker>,
    cgroups: Mutex<HashSet<u64>>,
    reconcile_guard: Mutex<()>,
}

impl<B: KernelBackend> LSMManager<B> {
    pub fn new(backend: Arc<B>) -> Self {
        Self {
            open: OpenEngine::new(backend.clone()),
            exec: ExecEngine::new(backend.clone()),
            connect: ConnectEngine::new(backend.clone()),
            mcp: Mutex::new(McpChecker::new(Vec::new())),
            cgroups: Mutex::new(HashSet::new()),
            reconcile_guard: Mutex::new(()),
            backend,
        }
    }

    /// Pushes a freshly transpiled policy set to all three engines plus the
    /// MCP checker. Engines are updated open, then exec, then connect; a
    /// failure partway (e.g. a rule table over capacity) leaves
    /// already-updated engines on their new table and not-yet-reached
    /// engines on their previous one — there is no atomic cross-engine
    /// rollback, since the alternative policy set to roll back to is itself
    /// only valid if it was already capacity-checked once.
    pub fn update_runtime_rules(&self, policy_set: &PolicySet) -> Result<(), LsmError> {
        let _guard = self.reconcile_guard.lock().expect("reconcile guard poisoned");
        self.open.reconcile(policy_set.open.clone())?;
        self.exec.reconcile(policy_set.exec.clone())?;
        self.connect.reconcile(policy_set)?;
        self.mcp.lock().expect("mcp checker lock poisoned").set_rules(policy_set.mcp.clone());
        Ok(())
    }

    pub fn track_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
        self.backend.add_cgroup(cgroup_id)?;
        self.cgroups.lock().expect("cgroup set lock poisoned").insert(cgroup_id);
        Ok(())
    }

    pub fn untrack_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
        self.backend.remove_cgroup(cgroup_id)?;
        self.cgroups.lock().expect("cgroup set lock poisoned").remove(&cgroup_id);
        Ok(())
    }

    pub fn tracked_cgroup_count(&self) -> usize {
        self.cgroups.lock().expect("cgroup set lock poisoned").len()
    }

    pub fn open(&self) -> &OpenEngine<B> {
        &self.open
    }

    pub fn exec(&self) -> &ExecEngine<B> {
        &self.exec
    }

    pub fn connect(&self) -> &ConnectEngine<B> {
        &self.connect
    }

    pub fn check_mcp(&self, server: &str, tool: &str) -> RuleEffect {
        self.mcp.lock().expect("mcp checker lock poisoned").evaluate(server, tool)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;
    use crate::backend::NullBackend;

    #[test]
    fn recognizes_cgroup_control_files() {
        assert!(is_cgroup_control_file("cgroup.procs"));
        assert!(is_cgroup_control_file("memory.max"));
        assert!(!is_cgroup_control_file("some_task_pid_listing"));
    }

    #[test]
    fn update_runtime_rules_pushes_all_engines() {
        let manager = LSMManager::new(Arc::new(NullBackend::new()));
        let mut policy_set = PolicySet::default();
        policy_set.open.push(leash_policy::ir::PolicyRule::file(
            RuleEffect::Allow,
            leash_policy::ir::Operation::Open,
            "/etc/hosts".to_string(),
            false,
        ));
        manager.update_runtime_rules(&policy_set).unwrap();
        assert_eq!(manager.open().evaluate("/etc/hosts"), RuleEffect::Allow);
    }

    #[test]
    fn tracks_and_untracks_cgroups() {
        let manager = LSMManager::new(Arc::new(NullBackend::new()));
        manager.track_cgroup(42).unwrap();
        assert_eq!(manager.tracked_cgroup_count(), 1);
        manager.untrack_cgroup(42).unwrap();
        assert_eq!(manager.tracked_cgroup_count(), 0);
    }
}
