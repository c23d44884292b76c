//! DICOM dataset helpers ported from the original `dicomnode.lib.dicom`
//! module: promoting a bare dataset to a valid file-meta-bearing object, and
//! minting fresh UIDs under a private root.

use dicom_core::{dicom_value, DataElement, Tag, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileDicomObject, FileMetaTableBuilder, InMemDicomObject};
use dicom_transfer_syntax_registry::entries::{
    EXPLICIT_VR_BIG_ENDIAN, EXPLICIT_VR_LITTLE_ENDIAN, IMPLICIT_VR_LITTLE_ENDIAN,
};
use uuid::Uuid;

use crate::error::{NodeError, Result};

/// Private UID root this framework mints instance/series/study UIDs under.
pub const DICOMNODE_ROOT_UID: &str = "1.2.826.0.1.3680043.10.1001";

/// Generate a fresh UID rooted at [`DICOMNODE_ROOT_UID`], truncated to the
/// DICOM 64-character UID limit.
pub fn gen_uid() -> String {
    let tail = Uuid::new_v4().as_u128().to_string();
    let mut uid = format!("{DICOMNODE_ROOT_UID}.{tail}");
    uid.truncate(64);
    uid
}

/// Promote a bare dataset to a valid file-meta-bearing object.
///
/// `is_little_endian`/`is_implicit_vr` mirror the flags pydicom carries on a
/// parsed dataset; callers that built a dataset from scratch should pass
/// `(true, true)` for the common case (Implicit VR Little Endian). Implicit
/// VR Big Endian is not a transfer syntax DICOM defines and is rejected.
/// `SOPInstanceUID` is minted with [`gen_uid`] when the dataset doesn't
/// already carry one; `SOPClassUID` is required and not synthesised.
pub fn make_meta(
    mut dataset: InMemDicomObject,
    is_little_endian: bool,
    is_implicit_vr: bool,
) -> Result<FileDicomObject<InMemDicomObject>> {
    let transfer_syntax = match (is_implicit_vr, is_little_endian) {
        (true, true) => IMPLICIT_VR_LITTLE_ENDIAN.uid(),
        (false, true) => EXPLICIT_VR_LITTLE_ENDIAN.uid(),
        (false, false) => EXPLICIT_VR_BIG_ENDIAN.uid(),
        (true, false) => {
            return Err(NodeError::invalid_dataset(
                "Implicit VR Big Endian is not a valid DICOM transfer syntax",
            ))
        }
    };

    let sop_class_uid = required_str(&dataset, tags::SOP_CLASS_UID)?;

    if dataset.element_opt(tags::SOP_INSTANCE_UID).ok().flatten().is_none() {
        dataset.put(DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, gen_uid()),
        ));
    }
    let sop_instance_uid = required_str(&dataset, tags::SOP_INSTANCE_UID)?;

    let meta = FileMetaTableBuilder::new()
        .media_storage_sop_class_uid(sop_class_uid)
        .media_storage_sop_instance_uid(sop_instance_uid)
        .transfer_syntax(transfer_syntax)
        .build()
        .map_err(|e| NodeError::invalid_dataset(format!("failed to build file meta: {e}")))?;

    Ok(dataset.with_exact_meta(meta))
}

fn required_str(dataset: &InMemDicomObject, tag: Tag) -> Result<String> {
    dataset
        .element_opt(tag)
        .map_err(|e| NodeError::invalid_dataset(e.to_string()))?
        .ok_or_else(|| NodeError::invalid_dataset(format!("missing required tag {tag}")))?
        .to_str()
        .map(|s| s.trim().to_string())
        .map_err(|e| NodeError::invalid_dataset(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gen_uid_is_rooted_and_bounded() {
        let uid = gen_uid();
        assert!(uid.starts_with(DICOMNODE_ROOT_UID));
        assert!(uid.len() <= 64);
    }

    #[test]
    fn implicit_big_endian_is_rejected() {
        let dataset = InMemDicomObject::new_empty();
        let result = make_meta(dataset, false, true);
        assert!(matches!(result, Err(NodeError::InvalidDataset(_))));
    }

    #[test]
    fn missing_sop_instance_uid_is_generated() {
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.7"),
        )]);
        let file_object = make_meta(dataset, true, true).unwrap();
        let generated = file_object
            .meta()
            .media_storage_sop_instance_uid()
            .trim_end_matches('\0')
            .to_string();
        assert!(generated.starts_with(DICOMNODE_ROOT_UID));
        assert_eq!(
            file_object
                .element(tags::SOP_INSTANCE_UID)
                .unwrap()
                .to_str()
                .unwrap(),
            generated
        );
    }

    #[test]
    fn missing_sop_class_uid_still_errors() {
        let dataset = InMemDicomObject::from_element_iter([DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "1.2.3"),
        )]);
        let result = make_meta(dataset, true, true);
        assert!(matches!(result, Err(NodeError::InvalidDataset(_))));
    }
}
