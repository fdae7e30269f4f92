//! Command-line and environment configuration, following the teacher's clap-derive
//! conventions (long flags with matching env fallbacks).

use crate::addr::Addr;
use crate::error::ConfigError;
use clap::Parser;

/// IPv6-to-mesh bridge configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "wirepas-ipv6-bridge", about = "Bridges IPv6 traffic onto a Wirepas mesh network")]
pub struct Cli {
    /// Network interface to discover the external IPv6 prefix on and install NDP-proxy
    /// entries against.
    #[arg(long, env = "WM_IPV6_EXTERNAL_INTERFACE", default_value = "tap0")]
    pub external_interface: String,

    /// Off-mesh service address published to sinks in their network-config TLV, e.g. a
    /// DNS resolver reachable outside the mesh. Empty string is treated as unset.
    #[arg(long, env = "WM_IPV6_OFF_MESH_SERVICE", default_value = "")]
    pub off_mesh_service: String,
}

impl Cli {
    pub fn into_bridge_config(self) -> Result<BridgeConfig, ConfigError> {
        let off_mesh_service = if self.off_mesh_service.trim().is_empty() {
            None
        } else {
            Some(
                Addr::parse(self.off_mesh_service.trim())
                    .map_err(|e| ConfigError::MalformedOffMeshService(self.off_mesh_service.clone(), e))?,
            )
        };
        Ok(BridgeConfig {
            external_interface: self.external_interface,
            off_mesh_service,
        })
    }
}

/// Validated configuration the bridge core runs with.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub external_interface: String,
    pub off_mesh_service: Option<Addr>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_off_mesh_service_normalizes_to_none() {
        let cli = Cli {
            external_interface: "tap0".to_string(),
            off_mesh_service: "".to_string(),
        };
        let config = cli.into_bridge_config().unwrap();
        assert!(config.off_mesh_service.is_none());
    }

    #[test]
    fn valid_off_mesh_service_parses() {
        let cli = Cli {
            external_interface: "tap0".to_string(),
            off_mesh_service: "2001:db8::53".to_string(),
        };
        let config = cli.into_bridge_config().unwrap();
        assert!(config.off_mesh_service.is_some());
    }

    #[test]
    fn malformed_off_mesh_service_is_rejected() {
        let cli = Cli {
            external_interface: "tap0".to_string(),
            off_mesh_service: "not-an-address".to_string(),
        };
        assert!(matches!(
            cli.into_bridge_config().unwrap_err(),
            ConfigError::MalformedOffMeshService(_, _)
        ));
    }
}
