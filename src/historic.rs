//! Historic input (`dicomnode.server.input.HistoricAbstractInput`): an
//! [`crate::input::Input`] that, on first arrival for a patient, issues an
//! outbound C-MOVE to backfill prior studies from a configured peer archive.
//! Fetched objects arrive back through the ordinary C-STORE path and are
//! admitted into the same patient slot like any other dataset.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_object::InMemDicomObject;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::dicom::gen_uid;
use crate::input::{Input, InputBacking, InputDeclaration};

/// One element of an outbound C-MOVE identifier dataset.
#[derive(Clone)]
pub enum BlueprintElement {
    /// Copy the named tag's value from the patient's header dataset.
    CopyElement(Tag),
    /// Stamp a fixed value regardless of the header.
    StaticElement(Tag, VR, String),
}

/// Declarative description of which tags to copy/fill when synthesising a
/// derived dataset — here, the C-MOVE identifier built from the patient's
/// header. The same type doubles as the `header_blueprint` hook the pipeline
/// node's output-synthesis collaborator consumes; this core only implements
/// the C-MOVE use.
#[derive(Clone, Default)]
pub struct Blueprint(pub Vec<BlueprintElement>);

impl Blueprint {
    pub fn build(&self, header: &InMemDicomObject) -> InMemDicomObject {
        let mut elements = Vec::with_capacity(self.0.len());
        for entry in &self.0 {
            match entry {
                BlueprintElement::CopyElement(tag) => {
                    if let Ok(Some(element)) = header.element_opt(*tag) {
                        elements.push(DataElement::new(*tag, element.vr(), element.value().clone()));
                    }
                }
                BlueprintElement::StaticElement(tag, vr, value) => {
                    elements.push(DataElement::new(*tag, *vr, dicom_value!(Str, value.clone())));
                }
            }
        }
        InMemDicomObject::from_element_iter(elements)
    }
}

/// Class-level configuration for a historic input: the underlying
/// [`InputDeclaration`] plus the peer to move from and the identifier
/// blueprint to move with.
#[derive(Clone)]
pub struct HistoricDeclaration {
    pub input: InputDeclaration,
    pub address: dimse::Address,
    pub blueprint: Blueprint,
}

impl HistoricDeclaration {
    pub fn spawn(&self, backing: Option<InputBacking>) -> HistoricInput {
        HistoricInput {
            inner: self.input.spawn(backing),
            declaration: self.clone(),
            move_task: None,
        }
    }
}

/// The mutable, per-patient state of a historic input: an [`Input`] plus
/// the at-most-one outbound C-MOVE task for this slot's lifetime.
pub struct HistoricInput {
    inner: Input,
    declaration: HistoricDeclaration,
    move_task: Option<JoinHandle<()>>,
}

impl HistoricInput {
    pub fn inner(&self) -> &Input {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut Input {
        &mut self.inner
    }

    /// Issue the at-most-once outbound C-MOVE for this slot. `calling_ae` is
    /// our own AE title, used both to call the peer and as the C-MOVE
    /// destination (fetched instances are pushed back to us). No-op if a
    /// move has already been started for this slot.
    pub fn start_move(&mut self, calling_ae: String, header: &InMemDicomObject) {
        if self.move_task.is_some() {
            return;
        }
        let identifier = self.declaration.blueprint.build(header);
        let address = self.declaration.address.clone();
        let destination_aet = calling_ae.clone();
        let patient_id = identifier
            .element_opt(dicom_dictionary_std::tags::PATIENT_ID)
            .ok()
            .flatten()
            .and_then(|e| e.to_str().ok().map(|s| s.to_string()))
            .unwrap_or_else(|| "<unknown>".to_string());

        self.move_task = Some(tokio::spawn(async move {
            let message_id = gen_uid();
            info!("issuing historic C-MOVE for patient {patient_id} (ref {message_id})");
            match dimse::move_request(calling_ae, address.clone(), destination_aet, identifier).await {
                Ok(status) if status == dimse::status::SUCCESS => {
                    info!("historic C-MOVE for patient {patient_id} completed");
                }
                Ok(status) => {
                    error!(
                        "historic C-MOVE for patient {patient_id} to {address} returned status {status:04X}H"
                    );
                }
                Err(e) => {
                    error!("historic C-MOVE for patient {patient_id} to {address} failed: {e}");
                }
            }
        }));
    }

    /// Cancel an in-flight C-MOVE on slot eviction. No-op once the move has
    /// already completed.
    pub fn abort(&mut self) {
        if let Some(handle) = self.move_task.take() {
            handle.abort();
        }
    }
}

impl Drop for HistoricInput {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_dictionary_std::tags;

    #[test]
    fn blueprint_copies_and_stamps() {
        let header = InMemDicomObject::from_element_iter([DataElement::new(
            tags::PATIENT_ID,
            VR::LO,
            dicom_value!(Str, "P1"),
        )]);
        let blueprint = Blueprint(vec![
            BlueprintElement::CopyElement(tags::PATIENT_ID),
            BlueprintElement::StaticElement(
                tags::QUERY_RETRIEVE_LEVEL,
                VR::CS,
                "PATIENT".to_string(),
            ),
        ]);
        let identifier = blueprint.build(&header);
        assert_eq!(
            identifier
                .element(tags::PATIENT_ID)
                .unwrap()
                .to_str()
                .unwrap(),
            "P1"
        );
        assert_eq!(
            identifier
                .element(tags::QUERY_RETRIEVE_LEVEL)
                .unwrap()
                .to_str()
                .unwrap(),
            "PATIENT"
        );
    }
}
