//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

use crate::DEFAULT_DIMSE_PORT;

/// Configuration for DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,

    /// Calling AE titles allowed to open an association. Empty means any
    /// calling AE is accepted.
    #[serde(default)]
    pub require_calling_aet: Vec<String>,

    /// Abstract syntaxes (SOP Class UIDs) the SCP negotiates beyond storage's
    /// own defaults.
    #[serde(default)]
    pub accepted_sop_classes: Vec<String>,
}

/// Configuration for a remote DICOM node (an outbound C-STORE/C-MOVE peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "DICOMNODE_SCP".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            max_associations: default_max_associations(),
            require_calling_aet: Vec::new(),
            accepted_sop_classes: Vec::new(),
        }
    }
}

impl DimseConfig {
    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.local_aet.is_empty() || self.local_aet.len() > 16 {
            return Err(crate::error::DimseError::config(
                "Local AE title must be 1-16 characters",
            ));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config("Port must be greater than 0"));
        }

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
        }
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.ae_title.is_empty() || self.ae_title.len() > 16 {
            return Err(crate::error::DimseError::config(
                "Remote AE title must be 1-16 characters",
            ));
        }

        if self.host.is_empty() {
            return Err(crate::error::DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config("Remote port must be greater than 0"));
        }

        Ok(())
    }
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_max_associations() -> u32 {
    10
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DimseConfig::default();
        assert_eq!(config.local_aet, "DICOMNODE_SCP");
        assert_eq!(config.port, DEFAULT_DIMSE_PORT);
    }

    #[test]
    fn test_remote_node_builder() {
        let node = RemoteNode::new("TEST_AET", "localhost", 11112);
        assert_eq!(node.ae_title, "TEST_AET");
        assert_eq!(node.host, "localhost");
        assert_eq!(node.port, 11112);
    }

    #[test]
    fn test_config_validation() {
        let mut config = DimseConfig::default();
        assert!(config.validate().is_ok());

        config.local_aet = "".to_string();
        assert!(config.validate().is_err());

        config.local_aet = "A".repeat(17);
        assert!(config.validate().is_err());
    }
}