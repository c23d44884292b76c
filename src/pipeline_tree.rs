//! Pipeline tree (`dicomnode.server.pipelineTree.PipelineTree`): the
//! per-patient container of declared [`crate::input::Input`]/
//! [`crate::historic::HistoricInput`] buffers plus the shared header
//! dataset used as an output-synthesis template.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dicom_core::Tag;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;

use crate::error::{NodeError, Result};
use crate::grinders::Ground;
use crate::historic::{HistoricDeclaration, HistoricInput};
use crate::input::{Input, InputBacking, InputDeclaration};

/// Shared behaviour between an ordinary [`Input`] and a [`HistoricInput`],
/// letting [`PatientSlot`] hold both behind one trait object map.
pub trait PipelineInput: Send {
    fn required_tags(&self) -> &[Tag];
    fn accepts(&self, dataset: &InMemDicomObject) -> bool;
    fn add(&mut self, dataset: InMemDicomObject) -> Result<usize>;
    fn is_valid(&self) -> bool;
    fn len(&self) -> usize;
    fn grind(&self) -> Result<Ground>;
    /// Called exactly once, the moment a patient slot is created, so
    /// historic inputs can kick off their at-most-one C-MOVE.
    fn notify_first_arrival(&mut self, _calling_ae: Arc<str>, _header: &InMemDicomObject) {}
    /// Called when the slot is evicted without (or after) dispatch, so
    /// historic inputs can cancel an in-flight C-MOVE.
    fn abort(&mut self) {}
}

impl PipelineInput for Input {
    fn required_tags(&self) -> &[Tag] {
        Input::required_tags(self)
    }
    fn accepts(&self, dataset: &InMemDicomObject) -> bool {
        Input::accepts(self, dataset)
    }
    fn add(&mut self, dataset: InMemDicomObject) -> Result<usize> {
        Input::add(self, dataset)
    }
    fn is_valid(&self) -> bool {
        Input::is_valid(self)
    }
    fn len(&self) -> usize {
        Input::len(self)
    }
    fn grind(&self) -> Result<Ground> {
        Input::grind(self)
    }
}

impl PipelineInput for HistoricInput {
    fn required_tags(&self) -> &[Tag] {
        self.inner().required_tags()
    }
    fn accepts(&self, dataset: &InMemDicomObject) -> bool {
        self.inner().accepts(dataset)
    }
    fn add(&mut self, dataset: InMemDicomObject) -> Result<usize> {
        self.inner_mut().add(dataset)
    }
    fn is_valid(&self) -> bool {
        self.inner().is_valid()
    }
    fn len(&self) -> usize {
        self.inner().len()
    }
    fn grind(&self) -> Result<Ground> {
        self.inner().grind()
    }
    fn notify_first_arrival(&mut self, calling_ae: Arc<str>, header: &InMemDicomObject) {
        self.start_move(calling_ae.to_string(), header);
    }
    fn abort(&mut self) {
        HistoricInput::abort(self);
    }
}

/// Class-level declaration of one named input, ordinary or historic.
#[derive(Clone)]
pub enum Declaration {
    Input(InputDeclaration),
    Historic(HistoricDeclaration),
}

impl Declaration {
    pub fn required_tags(&self) -> &[Tag] {
        match self {
            Declaration::Input(d) => &d.required_tags,
            Declaration::Historic(d) => &d.input.required_tags,
        }
    }

    fn spawn(&self, backing: Option<InputBacking>) -> Box<dyn PipelineInput> {
        match self {
            Declaration::Input(d) => Box::new(d.spawn(backing)),
            Declaration::Historic(d) => Box::new(d.spawn(backing)),
        }
    }
}

/// The per-patient row of the pipeline tree: every declared input's
/// current buffer, plus the first admitted dataset (the header).
pub struct PatientSlot {
    pub header: Option<InMemDicomObject>,
    pub inputs: BTreeMap<String, Box<dyn PipelineInput>>,
}

impl PatientSlot {
    /// `true` once every declared input's completeness predicate holds.
    pub fn ready(&self) -> bool {
        !self.inputs.is_empty() && self.inputs.values().all(|input| input.is_valid())
    }

    fn images(&self) -> usize {
        self.inputs.values().map(|input| input.len()).sum()
    }
}

fn patient_id(dataset: &InMemDicomObject) -> Result<String> {
    dataset
        .element_opt(tags::PATIENT_ID)
        .map_err(|e| NodeError::invalid_dataset(e.to_string()))?
        .ok_or(NodeError::MissingPatientId)?
        .to_str()
        .map_err(|e| NodeError::invalid_dataset(e.to_string()))
        .map(|s| s.trim().to_string())
}

/// `PatientID -> PatientSlot`, the per-node pipeline tree.
pub struct PipelineTree {
    declarations: Arc<BTreeMap<String, Declaration>>,
    calling_ae: Arc<str>,
    storage_root: Option<PathBuf>,
    patients: HashMap<String, PatientSlot>,
}

impl PipelineTree {
    pub fn new(
        declarations: BTreeMap<String, Declaration>,
        calling_ae: impl Into<Arc<str>>,
        storage_root: Option<PathBuf>,
    ) -> Self {
        Self {
            declarations: Arc::new(declarations),
            calling_ae: calling_ae.into(),
            storage_root,
            patients: HashMap::new(),
        }
    }

    fn new_slot(&self, patient_id: &str) -> PatientSlot {
        let mut inputs = BTreeMap::new();
        for (name, declaration) in self.declarations.iter() {
            let backing = self
                .storage_root
                .as_deref()
                .map(|root| InputBacking::new(root, patient_id, name));
            inputs.insert(name.clone(), declaration.spawn(backing));
        }
        PatientSlot {
            header: None,
            inputs,
        }
    }

    /// Route `dataset` to its patient slot (creating one if this is the
    /// first dataset seen for that PatientID), and to every declared input
    /// whose required tags are all present. Returns the PatientID.
    pub fn admit(&mut self, dataset: InMemDicomObject) -> Result<String> {
        let id = patient_id(&dataset)?;
        let is_new = !self.patients.contains_key(&id);
        let slot = self
            .patients
            .entry(id.clone())
            .or_insert_with(|| self.new_slot(&id));

        if slot.header.is_none() {
            slot.header = Some(dataset.clone());
        }

        for input in slot.inputs.values_mut() {
            if input.accepts(&dataset) {
                input.add(dataset.clone())?;
            }
        }

        if is_new {
            if let Some(header) = slot.header.clone() {
                for input in slot.inputs.values_mut() {
                    input.notify_first_arrival(self.calling_ae.clone(), &header);
                }
            }
        }

        Ok(id)
    }

    /// `true` if every declared input for `patient_id` currently validates.
    pub fn ready(&self, patient_id: &str) -> bool {
        self.patients.get(patient_id).map(PatientSlot::ready).unwrap_or(false)
    }

    /// Atomically detach the patient slot: a concurrent `admit` for the
    /// same PatientID starts a fresh slot rather than reusing this one.
    pub fn extract(&mut self, patient_id: &str) -> Option<PatientSlot> {
        self.patients.remove(patient_id)
    }

    /// Release buffered state for `patient_id` (if still present — a slot
    /// already taken by `extract` is a no-op here) and delete its
    /// filesystem-backed directory, if any.
    pub fn remove(&mut self, patient_id: &str) {
        if let Some(mut slot) = self.patients.remove(patient_id) {
            for input in slot.inputs.values_mut() {
                input.abort();
            }
        }
        self.delete_directory(patient_id);
    }

    /// Delete the on-disk patient directory without touching in-memory
    /// state — used after a slot has already been `extract`ed and
    /// dispatched.
    pub fn delete_directory(&self, patient_id: &str) {
        if let Some(root) = &self.storage_root {
            let dir = root.join(patient_id);
            if dir.exists() {
                let _ = std::fs::remove_dir_all(&dir);
            }
        }
    }

    pub fn storage_root(&self) -> Option<&Path> {
        self.storage_root.as_deref()
    }

    /// Total number of leaf datasets buffered across every patient slot.
    pub fn images(&self) -> usize {
        self.patients.values().map(PatientSlot::images).sum()
    }

    pub fn contains(&self, patient_id: &str) -> bool {
        self.patients.contains_key(patient_id)
    }

    /// The union of every declared input's required tags, deduplicated.
    /// Used at admission time to reject a sub-operation before it is routed
    /// to any individual input.
    pub fn required_tags(&self) -> std::collections::BTreeSet<Tag> {
        self.declarations
            .values()
            .flat_map(|d| d.required_tags().iter().copied())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grinders::Grinder;
    use dicom_core::{dicom_value, DataElement, VR};
    use std::sync::Arc as StdArc;

    fn dataset(patient: &str, instance: &str, sex: Option<&str>) -> InMemDicomObject {
        let mut elements = vec![
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, instance)),
        ];
        if let Some(sex) = sex {
            elements.push(DataElement::new(tags::PATIENT_SEX, VR::CS, dicom_value!(Str, sex)));
        }
        InMemDicomObject::from_element_iter(elements)
    }

    fn tree_with_one_input(required_sex: bool) -> PipelineTree {
        let mut required_tags = vec![tags::PATIENT_ID];
        if required_sex {
            required_tags.push(tags::PATIENT_SEX);
        }
        let declaration = InputDeclaration::new(
            required_tags,
            StdArc::new(|datasets: &[InMemDicomObject]| !datasets.is_empty()),
            Grinder::List,
        );
        let mut declarations = BTreeMap::new();
        declarations.insert("primary".to_string(), Declaration::Input(declaration));
        PipelineTree::new(declarations, "TEST_AE", None)
    }

    #[test]
    fn admit_skips_routing_when_input_tags_are_absent() {
        // The per-input required-tag gate (§4.D) only withholds routing to
        // that input; the node-level rejection of the whole sub-operation
        // (§4.F step 3, `required_tags_satisfied`) happens before `admit` is
        // ever called, so `admit` itself always succeeds once a PatientID
        // is present.
        let mut tree = tree_with_one_input(true);
        tree.admit(dataset("P1", "I1", None)).unwrap();
        assert_eq!(tree.images(), 0);
        assert!(tree.contains("P1"));
        assert!(!tree.ready("P1"));
    }

    #[test]
    fn ready_dispatch_once_per_slot() {
        let mut tree = tree_with_one_input(false);
        tree.admit(dataset("P1", "I1", Some("M"))).unwrap();
        assert!(tree.ready("P1"));
        let slot = tree.extract("P1").unwrap();
        assert_eq!(slot.images(), 1);
        assert!(!tree.contains("P1"));
    }

    #[test]
    fn slot_isolation_fresh_slot_during_dispatch() {
        let mut tree = tree_with_one_input(false);
        tree.admit(dataset("P1", "I1", Some("M"))).unwrap();
        let _dispatching = tree.extract("P1").unwrap();
        tree.admit(dataset("P1", "I2", Some("M"))).unwrap();
        let fresh = tree.extract("P1").unwrap();
        assert_eq!(fresh.images(), 1);
    }
}
