//! Input buffer (`dicomnode.server.input.AbstractInput`): a per-patient,
//! per-declared-name accumulator of Datasets with required-tag gating, a
//! user-overridable completeness predicate, a configured grinder, and
//! optional filesystem backing.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tracing::warn;

use crate::dicom::make_meta;
use crate::error::{NodeError, Result};
use crate::grinders::{Ground, Grinder};
use crate::tree::SeriesTree;

/// User-overridable completeness predicate, e.g. "all series are equal
/// length". Pure: called repeatedly, must not mutate hidden state.
pub type ValidatePredicate = Arc<dyn Fn(&[InMemDicomObject]) -> bool + Send + Sync>;

/// Class-level configuration for one declared input: the part of the
/// source's `AbstractInput` subclass that does not vary per patient.
#[derive(Clone)]
pub struct InputDeclaration {
    pub required_tags: Vec<Tag>,
    pub validate: ValidatePredicate,
    pub grinder: Grinder,
}

impl InputDeclaration {
    pub fn new(required_tags: Vec<Tag>, validate: ValidatePredicate, grinder: Grinder) -> Self {
        Self {
            required_tags,
            validate,
            grinder,
        }
    }

    /// Spawn a fresh, empty [`Input`] for a newly-created patient slot.
    pub fn spawn(&self, backing: Option<InputBacking>) -> Input {
        Input {
            declaration: self.clone(),
            held: SeriesTree::default(),
            last_validation: false,
            backing,
        }
    }
}

/// Filesystem backing for one Input inside one patient slot:
/// `<root_data_directory>/<PatientID>/<input_name>/`.
#[derive(Clone, Debug)]
pub struct InputBacking {
    dir: PathBuf,
}

impl InputBacking {
    pub fn new(root: &Path, patient_id: &str, input_name: &str) -> Self {
        Self {
            dir: root.join(patient_id).join(input_name),
        }
    }

    fn path_for(&self, sop_instance_uid: &str) -> PathBuf {
        self.dir.join(sop_instance_uid)
    }

    fn write_through(&self, dataset: &InMemDicomObject, sop_instance_uid: &str) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let file_object = make_meta(dataset.clone(), true, true)?;
        file_object
            .write_to_file(self.path_for(sop_instance_uid))
            .map_err(|e| NodeError::Storage(e.to_string()))
    }
}

/// The mutable, per-patient state of one declared input.
pub struct Input {
    declaration: InputDeclaration,
    held: SeriesTree,
    last_validation: bool,
    backing: Option<InputBacking>,
}

impl Input {
    pub fn required_tags(&self) -> &[Tag] {
        &self.declaration.required_tags
    }

    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// `true` if every required tag is present (and non-empty for string
    /// VRs) on `dataset`.
    pub fn accepts(&self, dataset: &InMemDicomObject) -> bool {
        self.declaration
            .required_tags
            .iter()
            .all(|tag| dataset.element_opt(*tag).ok().flatten().is_some())
    }

    /// Verify required tags, append `dataset`, write through to the
    /// filesystem backing if configured, and return the number of datasets
    /// now held. Fails fast with `MissingAttribute`/`MissingPatientId` if a
    /// required tag is absent.
    pub fn add(&mut self, dataset: InMemDicomObject) -> Result<usize> {
        for tag in &self.declaration.required_tags {
            if dataset.element_opt(*tag).ok().flatten().is_none() {
                if *tag == tags::PATIENT_ID {
                    return Err(NodeError::MissingPatientId);
                }
                return Err(NodeError::MissingAttribute(format!("{tag}")));
            }
        }

        let sop_instance_uid = dataset
            .element_opt(tags::SOP_INSTANCE_UID)
            .map_err(|e| NodeError::invalid_dataset(e.to_string()))?
            .ok_or_else(|| NodeError::MissingAttribute("SOPInstanceUID".to_string()))?
            .to_str()
            .map_err(|e| NodeError::invalid_dataset(e.to_string()))?
            .trim()
            .to_string();

        if let Some(backing) = &self.backing {
            backing.write_through(&dataset, &sop_instance_uid)?;
        }

        self.held.add(sop_instance_uid, dataset);
        self.last_validation = (self.declaration.validate)(&self.datasets());
        Ok(self.held.len())
    }

    /// Re-run the completeness predicate over the held datasets. Pure; safe
    /// to call repeatedly.
    pub fn validate(&mut self) -> bool {
        self.last_validation = (self.declaration.validate)(&self.datasets());
        self.last_validation
    }

    /// The last computed validation result, without re-running the
    /// predicate.
    pub fn is_valid(&self) -> bool {
        self.last_validation
    }

    /// Invoke the configured grinder over the held datasets (streamed back
    /// from disk first, if filesystem-backed).
    pub fn grind(&self) -> Result<Ground> {
        self.declaration.grinder.apply(&self.datasets())
    }

    fn datasets(&self) -> Vec<InMemDicomObject> {
        if let Some(backing) = &self.backing {
            match rehydrate(backing) {
                Ok(datasets) if !datasets.is_empty() => return datasets,
                Ok(_) => {}
                Err(e) => warn!("failed to stream datasets from disk, falling back to in-memory copy: {e}"),
            }
        }
        self.held.iter().cloned().collect()
    }
}

fn rehydrate(backing: &InputBacking) -> Result<Vec<InMemDicomObject>> {
    if !backing.dir.exists() {
        return Ok(Vec::new());
    }
    let mut datasets = Vec::new();
    for entry in std::fs::read_dir(&backing.dir)? {
        let entry = entry?;
        match dicom_object::open_file(entry.path()) {
            Ok(file_object) => datasets.push(file_object.into_inner()),
            Err(e) => warn!("discarding corrupt buffered file {}: {}", entry.path().display(), e),
        }
    }
    Ok(datasets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn dataset(patient: &str, instance: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, instance)),
        ])
    }

    fn always_valid() -> ValidatePredicate {
        Arc::new(|_| true)
    }

    #[test]
    fn add_enforces_required_tags() {
        let declaration = InputDeclaration::new(
            vec![tags::PATIENT_ID, tags::PATIENT_SEX],
            always_valid(),
            Grinder::List,
        );
        let mut input = declaration.spawn(None);
        let err = input.add(dataset("P1", "I1")).unwrap_err();
        assert!(matches!(err, NodeError::MissingAttribute(_)));
        assert_eq!(input.len(), 0);
    }

    #[test]
    fn add_accumulates_and_grinds() {
        let declaration = InputDeclaration::new(vec![tags::PATIENT_ID], always_valid(), Grinder::List);
        let mut input = declaration.spawn(None);
        input.add(dataset("P1", "I1")).unwrap();
        input.add(dataset("P1", "I2")).unwrap();
        assert_eq!(input.len(), 2);
        assert!(input.validate());
    }

    #[test]
    fn filesystem_backing_writes_through() {
        let tmp = tempfile::tempdir().unwrap();
        let backing = InputBacking::new(tmp.path(), "P1", "primary");
        let declaration = InputDeclaration::new(vec![tags::PATIENT_ID], always_valid(), Grinder::List);
        let mut input = declaration.spawn(Some(backing));
        input.add(dataset("P1", "I1")).unwrap();
        assert!(tmp.path().join("P1").join("primary").join("I1").exists());
    }
}
