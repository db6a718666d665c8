//! Kernel-facing enforcement: three LSM/eBPF engines (open, exec, connect)
//! behind a swappable [`backend::KernelBackend`], an in-process MCP rule
//! checker, and the [`manager::LSMManager`] that coordinates reconciliation
//! across all of them.

pub mod backend;
pub mod engines;
pub mod error;
pub mod event;
pub mod manager;
pub mod mcp;

pub use backend::Engine;
pub use backend::KernelBackend;
pub use backend::NullBackend;
pub use error::LsmError;
pub use manager::LSMManager;
pub use mcp::McpChecker;

#[cfg(target_os = "linux")]
pub use backend::linux::AyaBackend;
