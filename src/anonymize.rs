//! Anonymization collaborator (ported from `dicomnode.lib.anonymization`):
//! a transform driven by an [`IdentityMapping`] that walks a Dataset
//! recursively, blanking `PatientName`-bearing elements and remapping
//! UID-valued elements through the mapping so repeated identifiers
//! anonymize consistently across a study.

use dicom_core::header::Header;
use dicom_core::value::{DataSetSequence, Value as DicomValue};
use dicom_core::{Tag, VR};
use dicom_object::InMemDicomObject;

use crate::identity::IdentityMapping;

const PATIENT_NAME_TAG: Tag = dicom_dictionary_std::tags::PATIENT_NAME;
const PATIENT_ID_TAG: Tag = dicom_dictionary_std::tags::PATIENT_ID;
const STUDY_ID_TAG: Tag = dicom_dictionary_std::tags::STUDY_ID;

/// Default anonymized patient name stem, matching the source's
/// `BASE_ANONYMIZED_PATIENT_NAME`.
pub const BASE_ANONYMIZED_PATIENT_NAME: &str = "Anonymized_PatientName";

/// Configuration for one anonymization pass: the name stem to stamp on
/// `PatientName`, and an optional `StudyID` stem (source default `"Study"`).
pub struct AnonymizeOptions {
    pub patient_name: String,
    pub study_id: Option<String>,
}

impl Default for AnonymizeOptions {
    fn default() -> Self {
        Self {
            patient_name: BASE_ANONYMIZED_PATIENT_NAME.to_string(),
            study_id: Some("Study".to_string()),
        }
    }
}

/// Anonymize `dataset` in place against `mapping`: remaps `PatientID`
/// through the mapping (creating a fresh replacement the first time this
/// original PatientID is seen), stamps `PatientName`/`StudyID` from the
/// replacement's suffix, then recursively blanks every other `PN`-valued
/// element and remaps every `UI`-valued element (sequences, `VR::SQ`, are
/// walked depth-first).
pub fn anonymize_dataset(
    mapping: &mut IdentityMapping,
    dataset: &mut InMemDicomObject,
    options: &AnonymizeOptions,
) -> crate::error::Result<()> {
    let original_patient_id = dataset
        .element_opt(PATIENT_ID_TAG)
        .map_err(|e| crate::error::NodeError::invalid_dataset(e.to_string()))?
        .ok_or(crate::error::NodeError::MissingPatientId)?
        .to_str()
        .map_err(|e| crate::error::NodeError::invalid_dataset(e.to_string()))?
        .trim()
        .to_string();

    let new_patient_id = mapping.patient_mapping(&original_patient_id);
    let patient_number = suffix(&new_patient_id, mapping.prefix_size());

    set_str(dataset, PATIENT_ID_TAG, VR::LO, &new_patient_id);

    if let Some(study_id) = &options.study_id {
        set_str(dataset, STUDY_ID_TAG, VR::SH, &format!("{study_id}_{patient_number}"));
    }

    let patient_name = format!("{}_{patient_number}", options.patient_name);
    walk(dataset, mapping, &patient_name);
    Ok(())
}

/// The last `prefix_size` characters of `uid`, used as the human-readable
/// "patient number" stamped into `PatientName`/`StudyID`.
fn suffix(uid: &str, prefix_size: usize) -> String {
    if uid.len() <= prefix_size {
        uid.to_string()
    } else {
        uid[uid.len() - prefix_size..].to_string()
    }
}

fn walk(dataset: &mut InMemDicomObject, mapping: &mut IdentityMapping, patient_name: &str) {
    let tags: Vec<Tag> = dataset.iter().map(|e| e.header().tag).collect();
    for tag in tags {
        let Some(element) = dataset.element_opt(tag).ok().flatten() else {
            continue;
        };
        let vr = element.vr();

        if tag == PATIENT_NAME_TAG {
            set_str(dataset, tag, VR::PN, patient_name);
            continue;
        }

        match vr {
            VR::PN => {
                let anonymized = format!("Anon_{tag}");
                set_str(dataset, tag, VR::PN, &anonymized);
            }
            VR::SQ => {
                if let DicomValue::Sequence(seq) = element.value() {
                    let mut items = seq.items().to_vec();
                    let length = seq.length();
                    for item in &mut items {
                        walk(item, mapping, patient_name);
                    }
                    let new_seq = DataSetSequence::new(items.into(), length);
                    dataset.put_element(dicom_core::DataElement::new(
                        tag,
                        VR::SQ,
                        DicomValue::Sequence(new_seq),
                    ));
                }
            }
            VR::UI => {
                if let Some(original) = element.to_str().ok().map(|s| s.trim().to_string()) {
                    if let Some(replacement) = mapping.get(&original).cloned() {
                        set_str(dataset, tag, VR::UI, &replacement);
                    }
                }
            }
            _ => {}
        }
    }
}

fn set_str(dataset: &mut InMemDicomObject, tag: Tag, vr: VR, value: &str) {
    dataset.put_element(dicom_core::DataElement::new(
        tag,
        vr,
        dicom_core::dicom_value!(Str, value.to_string()),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_core::{dicom_value, DataElement};
    use dicom_dictionary_std::tags;

    fn dataset() -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "12345")),
            DataElement::new(tags::PATIENT_NAME, VR::PN, dicom_value!(Str, "Doe^John")),
            DataElement::new(
                tags::REFERRING_PHYSICIAN_NAME,
                VR::PN,
                dicom_value!(Str, "Smith^Jane"),
            ),
        ])
    }

    #[test]
    fn anonymizes_patient_name_and_id() {
        let mut mapping = IdentityMapping::new();
        let mut ds = dataset();
        anonymize_dataset(&mut mapping, &mut ds, &AnonymizeOptions::default()).unwrap();

        let new_id = ds.element(tags::PATIENT_ID).unwrap().to_str().unwrap().to_string();
        assert_ne!(new_id, "12345");

        let name = ds.element(tags::PATIENT_NAME).unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with(BASE_ANONYMIZED_PATIENT_NAME));

        let referring = ds
            .element(tags::REFERRING_PHYSICIAN_NAME)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(referring.starts_with("Anon_"));
    }

    #[test]
    fn same_patient_id_maps_consistently_across_datasets() {
        let mut mapping = IdentityMapping::new();
        let mut first = dataset();
        let mut second = dataset();
        anonymize_dataset(&mut mapping, &mut first, &AnonymizeOptions::default()).unwrap();
        anonymize_dataset(&mut mapping, &mut second, &AnonymizeOptions::default()).unwrap();

        assert_eq!(
            first.element(tags::PATIENT_ID).unwrap().to_str().unwrap(),
            second.element(tags::PATIENT_ID).unwrap().to_str().unwrap()
        );
    }
}
