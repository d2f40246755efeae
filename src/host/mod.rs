//! Host Executor: SSH-based remote Docker control, one
//! multiplexed session per host, plus the locking layer that keeps
//! concurrent deployments from racing each other on the same host.

pub mod executor;
pub mod lock;

pub use executor::{CommandOutput, ContainerInspect, ContainerSpec, HostExecutor};
pub use lock::{DeployLock, KeyedLocks};
