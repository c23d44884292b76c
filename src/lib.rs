//! dicomnode: a framework for building medical-imaging ingestion pipelines.
//!
//! A [`node::PipelineNode`] is a DIMSE C-STORE service class provider that
//! accumulates arriving Datasets into a patient-keyed
//! [`pipeline_tree::PipelineTree`] of [`input::Input`] buffers. Once every
//! declared input for a patient validates, the node dispatches a
//! user-supplied `process` function — synchronously, per-patient threaded,
//! or through a single queued worker (see [`concurrency::Dispatcher`]) — and
//! forwards the result through an [`output::Output`] adapter.
//!
//! The four-tier [`tree::DicomTree`] and the grinder algebra in
//! [`grinders`] are reusable on their own; [`historic`] and [`anonymize`]
//! are optional collaborators a pipeline can opt into.

pub mod anonymize;
pub mod concurrency;
pub mod config;
pub mod container;
pub mod dicom;
pub mod error;
pub mod grinders;
pub mod historic;
pub mod identity;
pub mod input;
pub mod node;
pub mod output;
pub mod pipeline_tree;
pub mod tree;

pub use config::PipelineNodeConfig;
pub use error::{NodeError, Result};
pub use node::PipelineNode;
