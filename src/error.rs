//! Error taxonomy for the pipeline core, mirroring `dimse::DimseError`'s shape
//! one layer up: every fallible operation in this crate returns
//! [`Result<T>`].

use thiserror::Error;

pub type Result<T> = std::result::Result<T, NodeError>;

/// Errors raised by the ingestion pipeline runtime.
#[derive(Error, Debug)]
pub enum NodeError {
    /// A dataset was malformed or used an unsupported transfer syntax
    /// (Implicit VR Big Endian).
    #[error("invalid dataset: {0}")]
    InvalidDataset(String),

    /// A dataset lacked `PatientID`, the one identifier every tier keys on.
    /// Surfaced to the peer as status `0xB007`.
    #[error("missing PatientID")]
    MissingPatientId,

    /// A dataset was missing a tag required by a tree tier or a declared
    /// Input. Surfaced to the peer as status `0xB006`.
    #[error("missing required attribute: {0}")]
    MissingAttribute(String),

    /// An outbound DIMSE operation (C-STORE, C-MOVE) failed in transport.
    #[error("could not complete DIMSE message: {0}")]
    CouldNotCompleteDIMSEMessage(String),

    /// A peer refused to establish an association.
    #[error("association rejected: {0}")]
    AssociationRejected(String),

    /// Filesystem-backed buffering failed (I/O error under the storage
    /// root).
    #[error("storage error: {0}")]
    Storage(String),

    /// An unhandled error escaped user-supplied code (`filter`, `process`, or
    /// `output.send`). Carries the name of the callback so CRITICAL log
    /// lines can name it.
    #[error("user function `{function}` failed: {source}")]
    UserFunction {
        function: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// A framework-internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl NodeError {
    pub fn invalid_dataset(msg: impl Into<String>) -> Self {
        Self::InvalidDataset(msg.into())
    }

    pub fn user_function(function: &'static str, source: impl Into<anyhow::Error>) -> Self {
        Self::UserFunction {
            function,
            source: source.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

impl From<dimse::DimseError> for NodeError {
    fn from(err: dimse::DimseError) -> Self {
        match err {
            dimse::DimseError::AssociationRejected(msg) => Self::AssociationRejected(msg),
            dimse::DimseError::Network(e) => Self::CouldNotCompleteDIMSEMessage(e.to_string()),
            dimse::DimseError::Timeout(msg) => Self::CouldNotCompleteDIMSEMessage(msg),
            dimse::DimseError::OperationFailed(msg) => Self::CouldNotCompleteDIMSEMessage(msg),
            dimse::DimseError::DicomParsing(msg) | dimse::DimseError::DicomObject(msg) => {
                Self::InvalidDataset(msg)
            }
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for NodeError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
