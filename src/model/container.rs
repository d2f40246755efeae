//! Container identity helpers.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The two colors a blue-green app/service alternates between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Color {
    Blue,
    Green,
}

impl Color {
    /// The color a fresh deploy should target after observing `current`.
    pub fn opposite(self) -> Self {
        match self {
            Color::Blue => Color::Green,
            Color::Green => Color::Blue,
        }
    }

    /// Default color for a first deploy of an app with no prior containers.
    pub fn first() -> Self {
        Color::Blue
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Color::Blue => f.write_str("blue"),
            Color::Green => f.write_str("green"),
        }
    }
}

impl std::str::FromStr for Color {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blue" => Ok(Color::Blue),
            "green" => Ok(Color::Green),
            other => anyhow::bail!("unknown color '{other}', expected 'blue' or 'green'"),
        }
    }
}

/// `<project>-network` — the project-scoped Docker network name.
pub fn network_name(project: &str) -> String {
    format!("{project}-network")
}

/// `<project>-<app>-<color>` (single replica) or `<project>-<app>-<color>-<index>`
/// (index 1..N) — the container name for a blue-green replica.
pub fn container_name(project: &str, app: &str, color: Color, replica_index: Option<u32>) -> String {
    match replica_index {
        Some(index) => format!("{project}-{app}-{color}-{index}"),
        None => format!("{project}-{app}-{color}"),
    }
}

/// `<app>` — the intra-project service-discovery alias.
pub fn app_alias(app: &str) -> String {
    app.to_string()
}

/// `<project>-<app>` — the globally unambiguous alias used as the proxy's
/// routing `target`: targets are always DNS aliases, never IPs, and this
/// alias is what prevents cross-project DNS leakage.
pub fn project_alias(project: &str, app: &str) -> String {
    format!("{project}-{app}")
}

/// Labels every blue-green container carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerLabels {
    pub project: String,
    pub app: String,
    pub color: Color,
    pub replica: u32,
    pub release: String,
    pub active: bool,
    /// Fingerprint of the inputs that produced this container, stored as a label so a later deploy can
    /// compare without re-deriving the container's full config.
    pub fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_round_trips() {
        assert_eq!(Color::Blue.opposite(), Color::Green);
        assert_eq!(Color::Green.opposite(), Color::Blue);
        assert_eq!(Color::Blue.opposite().opposite(), Color::Blue);
    }

    #[test]
    fn naming_matches_spec_shape() {
        assert_eq!(network_name("myproj"), "myproj-network");
        assert_eq!(
            container_name("myproj", "web", Color::Blue, None),
            "myproj-web-blue"
        );
        assert_eq!(
            container_name("myproj", "web", Color::Green, Some(2)),
            "myproj-web-green-2"
        );
        assert_eq!(project_alias("myproj", "web"), "myproj-web");
    }

    #[test]
    fn color_parses_from_str() {
        assert_eq!("blue".parse::<Color>().unwrap(), Color::Blue);
        assert_eq!("green".parse::<Color>().unwrap(), Color::Green);
        assert!("purple".parse::<Color>().is_err());
    }
}
