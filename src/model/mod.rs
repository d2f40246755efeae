//! Shared data model used by both the `iop` coordinator binary
//! and the `iop-proxy` edge proxy binary.

pub mod config;
pub mod container;
pub mod error;
pub mod project;
pub mod routing;

pub use config::{DeployConfig, HostConnection};
pub use container::{app_alias, container_name, network_name, project_alias, Color, ContainerLabels};
pub use error::{CoreError, CoreErrorExt, ErrorKind};
pub use project::{App, BuildSpec, Env, HealthSpec, PortSpec, Project, ProxySpec, Release, Service, VolumeSpec};
pub use routing::{CertificateState, CertificateStatus, RoutingEntry};
