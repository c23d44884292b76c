//! Output adapters (`dicomnode.server.output.PipelineOutput`): what happens
//! to the Datasets a pipeline's `process` function returns. Every adapter is
//! best-effort — a failed send is logged, not retried, per the node's
//! fire-and-forget dispatch contract.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dicom_object::InMemDicomObject;
use tracing::error;

use crate::dicom::make_meta;
use crate::error::Result;

/// One Dataset paired with the path it should be written to, relative to
/// whatever root the receiving adapter applies. Lets a single `send` call
/// route distinct Datasets to distinct destinations instead of collapsing
/// them all under one fixed location.
pub type OutputItem = (PathBuf, InMemDicomObject);

/// Something a dispatched pipeline's output Datasets can be handed to.
#[async_trait]
pub trait Output: Send + Sync {
    /// Attempt to deliver every item. Returns `false` on any failure;
    /// callers log and move on rather than retrying.
    async fn send(&self, items: &[OutputItem]) -> bool;
}

/// Discards output entirely — the default for pipelines that only observe.
pub struct NoOutput;

#[async_trait]
impl Output for NoOutput {
    async fn send(&self, _items: &[OutputItem]) -> bool {
        true
    }
}

/// Writes each Dataset to its own target path, resolved against `directory`
/// (an absolute `target_path` overrides `directory` entirely, since
/// `Path::join` replaces the base when joined with an absolute path).
pub struct FileOutput {
    pub directory: PathBuf,
}

impl FileOutput {
    pub fn new(directory: PathBuf) -> Self {
        Self { directory }
    }

    fn write_one(&self, target_path: &Path, dataset: &InMemDicomObject) -> Result<()> {
        let file_object = make_meta(dataset.clone(), true, true)?;
        let destination = self.directory.join(target_path);
        if let Some(parent) = destination.parent() {
            std::fs::create_dir_all(parent)?;
        }
        file_object
            .write_to_file(destination)
            .map_err(|e| crate::error::NodeError::Storage(e.to_string()))
    }
}

#[async_trait]
impl Output for FileOutput {
    async fn send(&self, items: &[OutputItem]) -> bool {
        for (target_path, dataset) in items {
            if let Err(e) = self.write_one(target_path, dataset) {
                error!(
                    "file output to {} failed: {e}",
                    self.directory.join(target_path).display()
                );
                return false;
            }
        }
        true
    }
}

/// Forwards each Dataset via outbound C-STORE to a configured peer.
pub struct DIMSEOutput {
    pub calling_ae: String,
    pub destination: dimse::Address,
}

impl DIMSEOutput {
    pub fn new(calling_ae: impl Into<String>, destination: dimse::Address) -> Self {
        Self {
            calling_ae: calling_ae.into(),
            destination,
        }
    }
}

#[async_trait]
impl Output for DIMSEOutput {
    async fn send(&self, items: &[OutputItem]) -> bool {
        let mut objects = Vec::with_capacity(items.len());
        for (_target_path, dataset) in items {
            match make_meta(dataset.clone(), true, true) {
                Ok(object) => objects.push(object),
                Err(e) => {
                    error!("DIMSE output could not build file meta: {e}");
                    return false;
                }
            }
        }

        match dimse::send_images(self.calling_ae.clone(), self.destination.clone(), objects).await {
            Ok(status) if status == dimse::status::SUCCESS => true,
            Ok(status) => {
                error!(
                    "DIMSE output to {} returned non-success status {status:04X}H",
                    self.destination
                );
                false
            }
            Err(e) => {
                error!("DIMSE output to {} failed: {e}", self.destination);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};
    use dicom_dictionary_std::tags;

    fn dataset() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
            DataElement::new(
                tags::SOP_CLASS_UID,
                VR::UI,
                dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.7"),
            ),
        ])
    }

    #[tokio::test]
    async fn no_output_always_succeeds() {
        assert!(NoOutput.send(&[(PathBuf::from("ignored.dcm"), dataset())]).await);
    }

    #[tokio::test]
    async fn file_output_writes_to_its_own_target_path() {
        let tmp = tempfile::tempdir().unwrap();
        let output = FileOutput::new(tmp.path().to_path_buf());
        let items = vec![
            (PathBuf::from("a/first.dcm"), dataset()),
            (PathBuf::from("b/second.dcm"), dataset()),
        ];
        assert!(output.send(&items).await);
        assert!(tmp.path().join("a/first.dcm").exists());
        assert!(tmp.path().join("b/second.dcm").exists());
    }
}
