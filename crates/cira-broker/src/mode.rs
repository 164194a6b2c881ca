//! Deployment modes

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

/// Which halves of the relay an instance runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeploymentMode {
    /// Terminates device tunnels and serves lookups from its own
    /// registry. The single-instance deployment.
    TunnelTerminating,
    /// Serves lookups only; channels to devices are brokered through
    /// the owning instance.
    RoutingTier,
    /// Terminates device tunnels but answers no lookups itself; peers
    /// reach its devices through the forward server.
    Passive,
}

impl DeploymentMode {
    pub fn terminates_tunnels(self) -> bool {
        !matches!(self, Self::RoutingTier)
    }

    pub fn serves_lookups(self) -> bool {
        !matches!(self, Self::Passive)
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::TunnelTerminating => "tunnel-terminating",
            Self::RoutingTier => "routing-tier",
            Self::Passive => "passive",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
#[error("Unknown deployment mode '{0}' (expected tunnel-terminating, routing-tier, or passive)")]
pub struct ParseModeError(String);

impl FromStr for DeploymentMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tunnel-terminating" => Ok(Self::TunnelTerminating),
            "routing-tier" => Ok(Self::RoutingTier),
            "passive" => Ok(Self::Passive),
            other => Err(ParseModeError(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_capabilities() {
        assert!(DeploymentMode::TunnelTerminating.terminates_tunnels());
        assert!(DeploymentMode::TunnelTerminating.serves_lookups());

        assert!(!DeploymentMode::RoutingTier.terminates_tunnels());
        assert!(DeploymentMode::RoutingTier.serves_lookups());

        assert!(DeploymentMode::Passive.terminates_tunnels());
        assert!(!DeploymentMode::Passive.serves_lookups());
    }

    #[test]
    fn test_parse_display_roundtrip() {
        for mode in [
            DeploymentMode::TunnelTerminating,
            DeploymentMode::RoutingTier,
            DeploymentMode::Passive,
        ] {
            let parsed: DeploymentMode = mode.to_string().parse().unwrap();
            assert_eq!(parsed, mode);
        }
    }

    #[test]
    fn test_parse_rejects_unknown_mode() {
        let result = "standalone".parse::<DeploymentMode>();
        assert!(result.is_err());
    }
}
