//! Service Class User (SCU) implementation for outbound DIMSE operations:
//! C-STORE (used by `DIMSEOutput` adapters) and C-MOVE (used by historic
//! inputs to request a back-fill from a peer archive).
//!
//! `dicom-ul`'s client association is a blocking API even though the rest of
//! this crate is async; every function here bridges it onto the Tokio
//! runtime with [`tokio::task::spawn_blocking`], matching the way the
//! reference DICOM-RST backend keeps blocking association I/O off the async
//! executor.

use std::net::ToSocketAddrs;

use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::{FileDicomObject, InMemDicomObject};
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_ul::pdu::{PDataValue, PDataValueType};
use dicom_ul::{ClientAssociationOptions, Pdu};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::{status, Address};
use crate::{DimseError, Result};

/// Patient Root Query/Retrieve Information Model - MOVE
const MOVE_PATIENT_ROOT: &str = "1.2.840.10008.5.1.4.1.2.1.1";

fn command_field(object: &InMemDicomObject) -> Option<u16> {
    object
        .element_opt(tags::COMMAND_FIELD)
        .ok()
        .flatten()
        .and_then(|e| e.to_int::<u16>().ok())
}

fn response_status(object: &InMemDicomObject) -> Result<u16> {
    object
        .element_opt(tags::STATUS)
        .map_err(|e| DimseError::DicomObject(e.to_string()))?
        .ok_or_else(|| DimseError::OperationFailed("response carried no Status element".into()))?
        .to_int::<u16>()
        .map_err(|e| DimseError::DicomParsing(e.to_string()))
}

fn build_store_command(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0001])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0000]),
        ),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

fn build_move_command(
    abstract_syntax: &str,
    destination_aet: &str,
    message_id: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, abstract_syntax),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x0021])),
        DataElement::new(tags::MESSAGE_ID, VR::US, dicom_value!(U16, [message_id])),
        DataElement::new(tags::PRIORITY, VR::US, dicom_value!(U16, [0x0000])),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0001]),
        ),
        DataElement::new(
            tags::MOVE_DESTINATION,
            VR::AE,
            dicom_value!(Str, destination_aet),
        ),
    ])
}

fn resolve_socket(address: &Address) -> Result<std::net::SocketAddr> {
    address
        .socket_addr_string()
        .to_socket_addrs()
        .map_err(DimseError::Network)?
        .next()
        .ok_or_else(|| DimseError::operation_failed(format!("could not resolve {address}")))
}

/// Blocking implementation of a single C-STORE; run on a blocking thread by
/// the async wrappers below.
fn send_image_blocking(
    calling_ae: &str,
    address: &Address,
    object: &FileDicomObject<InMemDicomObject>,
) -> Result<u16> {
    let socket_addr = resolve_socket(address)?;
    let sop_class_uid = object
        .meta()
        .media_storage_sop_class_uid()
        .trim_end_matches('\0')
        .to_string();
    let sop_instance_uid = object
        .meta()
        .media_storage_sop_instance_uid()
        .trim_end_matches('\0')
        .to_string();
    let transfer_syntax = object.meta().transfer_syntax().to_string();

    let options = ClientAssociationOptions::new()
        .with_abstract_syntax(sop_class_uid.clone())
        .calling_ae_title(calling_ae)
        .called_ae_title(address.ae_title.clone());

    let mut association = options
        .establish(socket_addr)
        .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

    let pc = association
        .presentation_contexts()
        .first()
        .cloned()
        .ok_or_else(|| DimseError::AssociationRejected("no accepted presentation context".into()))?;

    let ts = dicom_transfer_syntax_registry::TransferSyntaxRegistry
        .get(&transfer_syntax)
        .unwrap_or_else(|| IMPLICIT_VR_LITTLE_ENDIAN.erased());

    let cmd = build_store_command(&sop_class_uid, &sop_instance_uid, 1);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(&mut cmd_data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

    let mut dataset_bytes = Vec::with_capacity(4096);
    object
        .write_dataset_with_ts(&mut dataset_bytes, &ts)
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

    let pdu = Pdu::PData {
        data: vec![
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            },
            PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: dataset_bytes,
            },
        ],
    };
    association
        .send(&pdu)
        .map_err(|e| DimseError::operation_failed(e.to_string()))?;

    let response = association
        .receive()
        .map_err(|e| DimseError::operation_failed(e.to_string()))?;
    let status = match response {
        Pdu::PData { data } => {
            let command_bytes = &data
                .first()
                .ok_or_else(|| DimseError::OperationFailed("empty C-STORE response".into()))?
                .data;
            let command = InMemDicomObject::read_dataset_with_ts(
                &command_bytes[..],
                &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
            )
            .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
            response_status(&command)?
        }
        other => {
            let _ = association.abort();
            return Err(DimseError::operation_failed(format!(
                "unexpected response PDU: {other:?}"
            )));
        }
    };

    let _ = association.release();
    Ok(status)
}

/// Send a single dataset to `address`, waiting for the C-STORE-RSP.
pub async fn send_image(
    calling_ae: String,
    address: Address,
    object: FileDicomObject<InMemDicomObject>,
) -> Result<u16> {
    tokio::task::spawn_blocking(move || send_image_blocking(&calling_ae, &address, &object))
        .await
        .map_err(|e| DimseError::internal(format!("C-STORE task panicked: {e}")))?
}

/// Send every dataset in `objects` to `address` sequentially, returning the
/// worst status observed (any non-success status "wins" over `SUCCESS`).
pub async fn send_images(
    calling_ae: String,
    address: Address,
    objects: Vec<FileDicomObject<InMemDicomObject>>,
) -> Result<u16> {
    let mut aggregate = status::SUCCESS;
    for object in objects {
        match send_image(calling_ae.clone(), address.clone(), object).await {
            Ok(code) if code == status::SUCCESS => {}
            Ok(code) => {
                warn!(
                    "C-STORE sub-operation returned non-success status {:04X}H",
                    code
                );
                aggregate = code;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(aggregate)
}

/// Non-blocking variant of [`send_images`]: spawns the whole batch
/// immediately and returns a joinable handle, per the `send_images_thread`
/// contract of the DIMSE client.
pub fn send_images_thread(
    calling_ae: String,
    address: Address,
    objects: Vec<FileDicomObject<InMemDicomObject>>,
) -> JoinHandle<Result<u16>> {
    tokio::spawn(send_images(calling_ae, address, objects))
}

/// Issue a C-MOVE-RQ for the given identifier dataset, instructing the peer
/// to push matching instances to `destination_aet` (normally our own AE
/// title; the moved instances then arrive back through the ordinary C-STORE
/// path). Returns the final (non-pending) status code.
pub async fn move_request(
    calling_ae: String,
    address: Address,
    destination_aet: String,
    identifier: InMemDicomObject,
) -> Result<u16> {
    tokio::task::spawn_blocking(move || {
        move_request_blocking(&calling_ae, &address, &destination_aet, &identifier)
    })
    .await
    .map_err(|e| DimseError::internal(format!("C-MOVE task panicked: {e}")))?
}

fn move_request_blocking(
    calling_ae: &str,
    address: &Address,
    destination_aet: &str,
    identifier: &InMemDicomObject,
) -> Result<u16> {
    let socket_addr = resolve_socket(address)?;

    let options = ClientAssociationOptions::new()
        .with_abstract_syntax(MOVE_PATIENT_ROOT)
        .calling_ae_title(calling_ae)
        .called_ae_title(address.ae_title.clone());

    let mut association = options
        .establish(socket_addr)
        .map_err(|e| DimseError::AssociationRejected(e.to_string()))?;

    let pc = association
        .presentation_contexts()
        .first()
        .cloned()
        .ok_or_else(|| DimseError::AssociationRejected("no accepted presentation context".into()))?;

    let cmd = build_move_command(MOVE_PATIENT_ROOT, destination_aet, 1);
    let mut cmd_data = Vec::with_capacity(128);
    cmd.write_dataset_with_ts(&mut cmd_data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

    let mut identifier_data = Vec::with_capacity(128);
    identifier
        .write_dataset_with_ts(&mut identifier_data, &IMPLICIT_VR_LITTLE_ENDIAN.erased())
        .map_err(|e| DimseError::DicomParsing(e.to_string()))?;

    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Command,
                is_last: true,
                data: cmd_data,
            }],
        })
        .map_err(|e| DimseError::operation_failed(e.to_string()))?;
    association
        .send(&Pdu::PData {
            data: vec![PDataValue {
                presentation_context_id: pc.id,
                value_type: PDataValueType::Data,
                is_last: true,
                data: identifier_data,
            }],
        })
        .map_err(|e| DimseError::operation_failed(e.to_string()))?;

    debug!("C-MOVE-RQ sent to {address}, awaiting final response");

    loop {
        match association.receive() {
            Ok(Pdu::PData { data }) => {
                let command_bytes = &data
                    .first()
                    .ok_or_else(|| DimseError::OperationFailed("empty C-MOVE response".into()))?
                    .data;
                let command = InMemDicomObject::read_dataset_with_ts(
                    &command_bytes[..],
                    &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                )
                .map_err(|e| DimseError::DicomParsing(e.to_string()))?;
                let code = response_status(&command)?;
                if status::is_pending(code) {
                    continue;
                }
                let _ = association.release();
                info!("C-MOVE to {address} completed with status {:04X}H", code);
                return Ok(code);
            }
            Ok(other) => {
                let _ = association.abort();
                return Err(DimseError::operation_failed(format!(
                    "unexpected response PDU during C-MOVE: {other:?}"
                )));
            }
            Err(e) => {
                let _ = association.abort();
                return Err(DimseError::operation_failed(e.to_string()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_command_has_expected_fields() {
        let cmd = build_store_command("1.2.840.10008.5.1.4.1.1.7", "1.2.3.4", 7);
        assert_eq!(command_field(&cmd), Some(0x0001));
    }

    #[test]
    fn move_command_has_expected_fields() {
        let cmd = build_move_command(MOVE_PATIENT_ROOT, "DEST_AE", 3);
        assert_eq!(command_field(&cmd), Some(0x0021));
    }
}
