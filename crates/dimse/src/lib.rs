//! DIMSE (DICOM Message Service Element) implementation
//!
//! This crate provides both Service Class Provider (SCP) and Service Class User (SCU)
//! implementations for DICOM networking using the DIMSE protocol.
//!
//! # Features
//! - Inbound DIMSE services (SCP): C-STORE
//! - Outbound DIMSE services (SCU): C-STORE, C-MOVE

pub mod config;
pub mod error;
pub mod scp;
pub mod scu;
pub mod types;

// Re-export commonly used types
pub use config::{DimseConfig, RemoteNode};
pub use error::{DimseError, Result};
pub use scp::{DimseScp, StoreHandler};
pub use scu::{move_request, send_image, send_images, send_images_thread};
pub use types::{status, Address};

/// DIMSE protocol version
pub const DIMSE_VERSION: &str = "0.1.0";

/// Default DICOM port (non-TLS)
pub const DEFAULT_DIMSE_PORT: u16 = 11112;
