//! Four-tier hierarchical image tree: `PatientID -> StudyInstanceUID ->
//! SeriesInstanceUID -> SOPInstanceUID -> Dataset`.
//!
//! Every tier tracks its own leaf count so `images()` at the top is O(1);
//! `map`/`trim` walk leaves in insertion order within a tier (order across
//! sibling subtrees is unspecified, matching the ordering guarantee in the
//! data model).

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use dicom_dictionary_std::tags;
use dicom_object::{open_file, InMemDicomObject};
use tracing::warn;

use crate::error::{NodeError, Result};

fn required_str(dataset: &InMemDicomObject, tag: dicom_core::Tag, name: &'static str) -> Result<String> {
    let value = dataset
        .element_opt(tag)
        .map_err(|e| NodeError::InvalidDataset(e.to_string()))?
        .ok_or_else(|| NodeError::MissingAttribute(name.to_string()))?
        .to_str()
        .map_err(|e| NodeError::InvalidDataset(e.to_string()))?
        .trim()
        .to_string();
    if value.is_empty() {
        return Err(NodeError::MissingAttribute(name.to_string()));
    }
    Ok(value)
}

fn patient_id(dataset: &InMemDicomObject) -> Result<String> {
    let value = dataset
        .element_opt(tags::PATIENT_ID)
        .map_err(|e| NodeError::InvalidDataset(e.to_string()))?
        .ok_or(NodeError::MissingPatientId)?
        .to_str()
        .map_err(|e| NodeError::InvalidDataset(e.to_string()))?
        .trim()
        .to_string();
    if value.is_empty() {
        return Err(NodeError::MissingPatientId);
    }
    Ok(value)
}

/// Leaf container: `SOPInstanceUID -> Dataset`.
#[derive(Default, Debug)]
pub struct SeriesTree {
    order: Vec<String>,
    instances: HashMap<String, InMemDicomObject>,
}

impl SeriesTree {
    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Insert or overwrite; identical SOPInstanceUIDs are idempotent (the
    /// dataset is replaced but the original position is kept).
    pub fn add(&mut self, sop_instance_uid: String, dataset: InMemDicomObject) {
        if !self.instances.contains_key(&sop_instance_uid) {
            self.order.push(sop_instance_uid.clone());
        }
        self.instances.insert(sop_instance_uid, dataset);
    }

    pub fn map(&self, f: &mut dyn FnMut(&InMemDicomObject)) {
        for key in &self.order {
            f(&self.instances[key]);
        }
    }

    pub fn trim(&mut self, pred: &mut dyn FnMut(&InMemDicomObject) -> bool) -> usize {
        let instances = &mut self.instances;
        let before = self.order.len();
        self.order.retain(|key| {
            let keep = pred(&instances[key]);
            if !keep {
                instances.remove(key);
            }
            keep
        });
        before - self.order.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &InMemDicomObject> {
        self.order.iter().map(move |key| &self.instances[key])
    }
}

/// `SeriesInstanceUID -> SeriesTree`.
#[derive(Default, Debug)]
pub struct StudyTree {
    series: BTreeMap<String, SeriesTree>,
}

impl StudyTree {
    pub fn len(&self) -> usize {
        self.series.values().map(SeriesTree::len).sum()
    }

    pub fn add(&mut self, series_uid: String, sop_instance_uid: String, dataset: InMemDicomObject) {
        self.series
            .entry(series_uid)
            .or_default()
            .add(sop_instance_uid, dataset);
    }

    pub fn map(&self, f: &mut dyn FnMut(&InMemDicomObject)) {
        for series in self.series.values() {
            series.map(f);
        }
    }

    pub fn trim(&mut self, pred: &mut dyn FnMut(&InMemDicomObject) -> bool) -> usize {
        let mut removed = 0;
        self.series.retain(|_, series| {
            removed += series.trim(pred);
            !series.is_empty()
        });
        removed
    }

    pub fn series(&self) -> impl Iterator<Item = (&String, &SeriesTree)> {
        self.series.iter()
    }
}

/// `StudyInstanceUID -> StudyTree`.
#[derive(Default, Debug)]
pub struct PatientTree {
    studies: BTreeMap<String, StudyTree>,
}

impl PatientTree {
    pub fn len(&self) -> usize {
        self.studies.values().map(StudyTree::len).sum()
    }

    pub fn add(
        &mut self,
        study_uid: String,
        series_uid: String,
        sop_instance_uid: String,
        dataset: InMemDicomObject,
    ) {
        self.studies
            .entry(study_uid)
            .or_default()
            .add(series_uid, sop_instance_uid, dataset);
    }

    pub fn map(&self, f: &mut dyn FnMut(&InMemDicomObject)) {
        for study in self.studies.values() {
            study.map(f);
        }
    }

    pub fn trim(&mut self, pred: &mut dyn FnMut(&InMemDicomObject) -> bool) -> usize {
        let mut removed = 0;
        self.studies.retain(|_, study| {
            removed += study.trim(pred);
            study.len() > 0
        });
        removed
    }

    pub fn studies(&self) -> impl Iterator<Item = (&String, &StudyTree)> {
        self.studies.iter()
    }
}

/// `PatientID -> PatientTree`, plus a top-level leaf count.
#[derive(Default, Debug)]
pub struct DicomTree {
    patients: BTreeMap<String, PatientTree>,
}

impl DicomTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of leaf Datasets across the whole tree.
    pub fn images(&self) -> usize {
        self.patients.values().map(PatientTree::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    /// Insert `dataset` into the tier implied by its `PatientID`,
    /// `StudyInstanceUID`, `SeriesInstanceUID` and `SOPInstanceUID`, creating
    /// intermediate nodes as needed. Fails with `MissingPatientId` or
    /// `MissingAttribute` if any of those four tags are absent or empty.
    pub fn add(&mut self, dataset: InMemDicomObject) -> Result<usize> {
        let patient = patient_id(&dataset)?;
        let study = required_str(&dataset, tags::STUDY_INSTANCE_UID, "StudyInstanceUID")?;
        let series = required_str(&dataset, tags::SERIES_INSTANCE_UID, "SeriesInstanceUID")?;
        let instance = required_str(&dataset, tags::SOP_INSTANCE_UID, "SOPInstanceUID")?;

        self.patients
            .entry(patient)
            .or_default()
            .add(study, series, instance, dataset);
        Ok(self.images())
    }

    pub fn map(&self, mut f: impl FnMut(&InMemDicomObject)) {
        for patient in self.patients.values() {
            patient.map(&mut f);
        }
    }

    /// Remove every leaf for which `pred` returns false, propagating
    /// deletions upward so empty interior nodes disappear. Returns the
    /// number of leaves removed.
    pub fn trim(&mut self, mut pred: impl FnMut(&InMemDicomObject) -> bool) -> usize {
        let mut removed = 0;
        self.patients.retain(|_, patient| {
            removed += patient.trim(&mut pred);
            patient.len() > 0
        });
        removed
    }

    pub fn patients(&self) -> impl Iterator<Item = (&String, &PatientTree)> {
        self.patients.iter()
    }

    pub fn patient(&self, patient_id: &str) -> Option<&PatientTree> {
        self.patients.get(patient_id)
    }

    /// Recursively load every file under `path` and admit it. Parse failures
    /// are fatal unless `strict` is false, in which case they are logged and
    /// skipped.
    pub fn discover(path: &Path, strict: bool) -> Result<Self> {
        let mut tree = Self::new();
        let mut stack = vec![path.to_path_buf()];
        while let Some(dir) = stack.pop() {
            let entries = std::fs::read_dir(&dir)?;
            for entry in entries {
                let entry = entry?;
                let entry_path = entry.path();
                if entry_path.is_dir() {
                    stack.push(entry_path);
                    continue;
                }
                match open_file(&entry_path) {
                    Ok(file_object) => {
                        if let Err(e) = tree.add(file_object.into_inner()) {
                            if strict {
                                return Err(e);
                            }
                            warn!("skipping {}: {}", entry_path.display(), e);
                        }
                    }
                    Err(e) => {
                        if strict {
                            return Err(NodeError::InvalidDataset(e.to_string()));
                        }
                        warn!("failed to parse {}: {}", entry_path.display(), e);
                    }
                }
            }
        }
        Ok(tree)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement, VR};

    fn dataset(patient: &str, study: &str, series: &str, instance: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(
                tags::STUDY_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, study),
            ),
            DataElement::new(
                tags::SERIES_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, series),
            ),
            DataElement::new(
                tags::SOP_INSTANCE_UID,
                VR::UI,
                dicom_value!(Str, instance),
            ),
        ])
    }

    #[test]
    fn count_consistency() {
        let mut tree = DicomTree::new();
        tree.add(dataset("P1", "S1", "SE1", "I1")).unwrap();
        tree.add(dataset("P1", "S1", "SE1", "I2")).unwrap();
        tree.add(dataset("P2", "S2", "SE2", "I3")).unwrap();
        assert_eq!(tree.images(), 3);
        assert_eq!(tree.patient("P1").unwrap().len(), 2);
    }

    #[test]
    fn idempotent_insert() {
        let mut tree = DicomTree::new();
        tree.add(dataset("P1", "S1", "SE1", "I1")).unwrap();
        tree.add(dataset("P1", "S1", "SE1", "I1")).unwrap();
        assert_eq!(tree.images(), 1);
    }

    #[test]
    fn trim_removes_matching_leaves_and_empty_nodes() {
        let mut tree = DicomTree::new();
        tree.add(dataset("P1", "S1", "SE1", "I1")).unwrap();
        tree.add(dataset("P2", "S2", "SE2", "I2")).unwrap();
        let removed = tree.trim(|_| false);
        assert_eq!(removed, 2);
        assert_eq!(tree.images(), 0);
        assert!(tree.is_empty());
    }

    #[test]
    fn missing_patient_id_is_rejected() {
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::STUDY_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "S1"),
        )]);
        let mut tree = DicomTree::new();
        let err = tree.add(dataset).unwrap_err();
        assert!(matches!(err, NodeError::MissingPatientId));
    }

    #[test]
    fn missing_other_tag_is_rejected() {
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P1"),
        )]);
        let mut tree = DicomTree::new();
        let err = tree.add(dataset).unwrap_err();
        assert!(matches!(err, NodeError::MissingAttribute(_)));
    }
}
