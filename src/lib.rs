//! `iop`: blue-green deployment coordinator (`iop` binary) and self-hosted
//! TLS edge proxy (`iop-proxy` binary) for a fleet of SSH-reachable Docker
//! hosts.

pub mod model;

#[cfg(feature = "cli")]
pub mod build;
#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod coordinator;
#[cfg(feature = "cli")]
pub mod host;

#[cfg(feature = "proxy")]
pub mod proxy;
