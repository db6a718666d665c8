//! Abstracts the actual LSM/eBPF attachment behind a trait so the engines'
//! rule-table and reconciliation logic can be exercised without a real
//! kernel. [`NullBackend`] is the default off-Linux (and test) backend;
//! [`linux::AyaBackend`] is the real one.

use std::time::Duration;

use leash_policy::ir::PolicyRule;

use crate::error::LsmError;

/// One of the three enforcement points the runtime manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    Open,
    Exec,
    Connect,
}

impl Engine {
    pub fn as_str(self) -> &'static str {
        match self {
            Engine::Open => "open",
            Engine::Exec => "exec",
            Engine::Connect => "connect",
        }
    }
}

/// The operations an attached kernel backend must support. Rule updates are
/// full-table replacements: the caller always passes the complete, sorted
/// rule set for an engine, not a delta.
pub trait KernelBackend: Send + Sync {
    fn update_rules(&self, engine: Engine, rules: &[PolicyRule]) -> Result<(), LsmError>;
    fn set_connect_default(&self, allow: bool) -> Result<(), LsmError>;
    fn add_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError>;
    fn remove_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError>;

    /// Drains whatever ring buffer records are currently available for
    /// `engine`, waiting up to `timeout` if the buffer is empty. Returns
    /// raw byte records for [`crate::event`] to decode.
    fn poll_events(&self, engine: Engine, timeout: Duration) -> Result<Vec<Vec<u8>>, LsmError>;
}

/// Lets callers that only know their backend's concrete type at runtime
/// (e.g. `leash-runtime` choosing between [`NullBackend`] and
/// `linux::AyaBackend` based on the host OS and an object-file path) hand
/// an `Arc<dyn KernelBackend>` to [`crate::manager::LSMManager`].
impl KernelBackend for std::sync::Arc<dyn KernelBackend> {
    fn update_rules(&self, engine: Engine, rules: &[PolicyRule]) -> Result<(), LsmError> {
        (**self).update_rules(engine, rules)
    }

    fn set_connect_default(&self, allow: bool) -> Result<(), LsmError> {
        (**self).set_connect_default(allow)
    }

    fn add_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
        (**self).add_cgroup(cgroup_id)
    }

    fn remove_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
        (**self).remove_cgroup(cgroup_id)
    }

    fn poll_events(&self, engine: Engine, timeout: Duration) -> Result<Vec<Vec<u8>>, LsmError> {
        (**self).poll_events(engine, timeout)
    }
}

/// A backend that accepts every call and never produces events. Used when
/// `target_os` isn't Linux, and in tests that only exercise the engines'
/// own bookkeeping.
#[derive(Default)]
pub struct NullBackend {
    state: std::sync::Mutex<NullState>,
}

#[derive(Default)]
struct NullState {
    rules: std::collections::HashMap<&'static str, Vec<PolicyRule>>,
    cgroups: std::collections::HashSet<u64>,
    connect_default_allow: bool,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rules_for(&self, engine: Engine) -> Vec<PolicyRule> {
        self.state
            .lock()
            .expect("null backend lock poisoned")
            .rules
            .get(engine.as_str())
            .cloned()
            .unwrap_or_default()
    }

    pub fn cgroup_count(&self) -> usize {
        self.state.lock().expect("null backend lock poisoned").cgroups.len()
    }
}

impl KernelBackend for NullBackend {
    fn update_rules(&self, engine: Engine, rules: &[PolicyRule]) -> Result<(), LsmError> {
        self.state
            .lock()
            .expect("null backend lock poisoned")
            .rules
            .insert(engine.as_str(), rules.to_vec());
        Ok(())
    }

    fn set_connect_default(&self, allow: bool) -> Result<(), LsmError> {
        self.state.lock().expect("null backend lock poisoned").connect_default_allow = allow;
        Ok(())
    }

    fn add_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
        self.state.lock().expect("null backend lock poisoned").cgroups.insert(cgroup_id);
        Ok(())
    }

    fn remove_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
        self.state.lock().expect("null backend lock poisoned").cgroups.remove(&cgroup_id);
        Ok(())
    }

    fn poll_events(&self, _engine: Engine, _timeout: Duration) -> Result<Vec<Vec<u8>>, LsmError> {
        Ok(Vec::new())
    }
}

#[cfg(target_os = "linux")]
pub mod linux {
    use std::path::Path;
    use std::time::Duration;

    use aya::Ebpf;
    use aya::maps::HashMap as AyaHashMap;
    use aya::maps::RingBuf;

    use leash_policy::ir::PolicyRule;
    use leash_policy::ir::RuleEffect;

    use super::Engine;
    use super::KernelBackend;
    use crate::error::LsmError;

    const OPEN_RULES_MAP: &str = "OPEN_RULES";
    const EXEC_RULES_MAP: &str = "EXEC_RULES";
    const CONNECT_RULES_MAP: &str = "CONNECT_RULES";
    const CONNECT_DEFAULT_MAP: &str = "CONNECT_DEFAULT";
    const CGROUP_SET_MAP: &str = "CGROUP_SET";
    const OPEN_EVENTS_MAP: &str = "OPEN_EVENTS";
    const EXEC_EVENTS_MAP: &str = "EXEC_EVENTS";
    const CONNECT_EVENTS_MAP: &str = "CONNECT_EVENTS";

    /// Attaches the Leash LSM/eBPF programs from a pre-built object file
    /// and exposes their maps through [`KernelBackend`].
    pub struct AyaBackend {
        ebpf: std::sync::Mutex<Ebpf>,
    }

    impl AyaBackend {
        pub fn load(object_path: &Path) -> Result<Self, LsmError> {
            let mut ebpf = Ebpf::load_file(object_path).map_err(|e| LsmError::Backend(e.to_string()))?;
            if let Err(e) = aya_log::EbpfLogger::init(&mut ebpf) {
                tracing::warn!(error = %e, "continuing without eBPF log forwarding");
            }
            for program in ebpf.programs_mut() {
                let _ = program.pin(format!("/sys/fs/bpf/leash_{}", program.name()));
            }
            Ok(Self { ebpf: std::sync::Mutex::new(ebpf) })
        }

        fn rules_map_name(engine: Engine) -> &'static str {
            match engine {
                Engine::Open => OPEN_RULES_MAP,
                Engine::Exec => EXEC_RULES_MAP,
                Engine::Connect => CONNECT_RULES_MAP,
            }
        }

        fn events_map_name(engine: Engine) -> &'static str {
            match engine {
                Engine::Open => OPEN_EVENTS_MAP,
                Engine::Exec => EXEC_EVENTS_MAP,
                Engine::Connect => CONNECT_EVENTS_MAP,
            }
        }
    }

    impl KernelBackend for AyaBackend {
        fn update_rules(&self, engine: Engine, rules: &[PolicyRule]) -> Result<(), LsmError> {
            let mut ebpf = self.ebpf.lock().expect("aya backend lock poisoned");
            let map = ebpf
                .map_mut(Self::rules_map_name(engine))
                .ok_or_else(|| LsmError::Backend(format!("missing map {}", Self::rules_map_name(engine))))?;
            let mut table: AyaHashMap<_, u32, u8> =
                AyaHashMap::try_from(map).map_err(|e| LsmError::Backend(e.to_string()))?;
            for (index, rule) in rules.iter().enumerate() {
                let deny = matches!(rule.effect, RuleEffect::Deny) as u8;
                table
                    .insert(index as u32, deny, 0)
                    .map_err(|e| LsmError::Backend(e.to_string()))?;
            }
            Ok(())
        }

        fn set_connect_default(&self, allow: bool) -> Result<(), LsmError> {
            let mut ebpf = self.ebpf.lock().expect("aya backend lock poisoned");
            let map = ebpf
                .map_mut(CONNECT_DEFAULT_MAP)
                .ok_or_else(|| LsmError::Backend(format!("missing map {CONNECT_DEFAULT_MAP}")))?;
            let mut table: AyaHashMap<_, u32, u8> =
                AyaHashMap::try_from(map).map_err(|e| LsmError::Backend(e.to_string()))?;
            table.insert(0u32, allow as u8, 0).map_err(|e| LsmError::Backend(e.to_string()))
        }

        fn add_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
            let mut ebpf = self.ebpf.lock().expect("aya backend lock poisoned");
            let map = ebpf
                .map_mut(CGROUP_SET_MAP)
                .ok_or_else(|| LsmError::Backend(format!("missing map {CGROUP_SET_MAP}")))?;
            let mut table: AyaHashMap<_, u64, u8> =
                AyaHashMap::try_from(map).map_err(|e| LsmError::Backend(e.to_string()))?;
            table.insert(cgroup_id, 1u8, 0).map_err(|e| LsmError::Backend(e.to_string()))
        }

        fn remove_cgroup(&self, cgroup_id: u64) -> Result<(), LsmError> {
            let mut ebpf = self.ebpf.lock().expect("aya backend lock poisoned");
            let map = ebpf
                .map_mut(CGROUP_SET_MAP)
                .ok_or_else(|| LsmError::Backend(format!("missing map {CGROUP_SET_MAP}")))?;
            let mut table: AyaHashMap<_, u64, u8> =
                AyaHashMap::try_from(map).map_err(|e| LsmError::Backend(e.to_string()))?;
            let _ = table.remove(&cgroup_id);
            Ok(())
        }

        fn poll_events(&self, engine: Engine, timeout: Duration) -> Result<Vec<Vec<u8>>, LsmError> {
            let mut ebpf = self.ebpf.lock().expect("aya backend lock poisoned");
            let map = ebpf
                .map_mut(Self::events_map_name(engine))
                .ok_or_else(|| LsmError::Backend(format!("missing map {}", Self::events_map_name(engine))))?;
            let mut ring: RingBuf<_> = RingBuf::try_from(map).map_err(|e| LsmError::Backend(e.to_string()))?;
            let mut records = Vec::new();
            let deadline = std::time::Instant::now() + timeout;
            while let Some(item) = ring.next() {
                records.push(item.to_vec());
                if std::time::Instant::now() >= deadline {
                    break;
                }
            }
            Ok(records)
        }
    }
}
