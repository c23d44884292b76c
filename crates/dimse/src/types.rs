//! Common wire-level types for DIMSE operations: peer addresses and the
//! standard 16-bit status codes exchanged between SCU and SCP.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A DIMSE peer: host, port and the Application Entity Title it answers to.
///
/// `ae_title` is the *remote* AE title for outbound operations (the node we
/// are calling); the calling AE title is supplied separately by the caller
/// of the [`crate::scu`] functions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
    pub ae_title: String,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16, ae_title: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            ae_title: ae_title.into(),
        }
    }

    pub fn socket_addr_string(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// DIMSE standard 16-bit status codes used by the pipeline.
pub mod status {
    /// Sub-operation (or association) completed successfully.
    pub const SUCCESS: u16 = 0x0000;
    /// Association refused, or the dataset was filtered out by user `filter`.
    pub const FILTER_REJECTED: u16 = 0xA801;
    /// Dataset was missing a tag required by a declared input.
    pub const MISSING_ATTRIBUTE: u16 = 0xB006;
    /// Dataset was missing `PatientID`.
    pub const MISSING_PATIENT_ID: u16 = 0xB007;
    /// Unhandled error while processing (framework- or user-level).
    pub const PROCESSING_ERROR: u16 = 0xC000;

    /// `true` for the range of values DICOM treats as a C-MOVE/C-FIND
    /// "pending" (sub-operations remain) response.
    pub fn is_pending(status: u16) -> bool {
        matches!(status, 0xFF00 | 0xFF01)
    }

    /// `true` for a warning-class status (operation completed with caveats).
    pub fn is_warning(status: u16) -> bool {
        matches!(status, 0x0001 | 0x0107 | 0x0116) || (0xB000..=0xBFFF).contains(&status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_display() {
        let addr = Address::new("localhost", 11112, "REMOTE_SCP");
        assert_eq!(addr.to_string(), "REMOTE_SCP@localhost:11112");
        assert_eq!(addr.socket_addr_string(), "localhost:11112");
    }

    #[test]
    fn status_classification() {
        assert!(status::is_pending(0xFF00));
        assert!(!status::is_pending(status::SUCCESS));
        assert!(status::is_warning(0xB000));
        assert!(!status::is_warning(status::SUCCESS));
    }
}
