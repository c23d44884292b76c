//! Service Class Provider (SCP) implementation for inbound C-STORE
//! operations: the network front end a [`crate::types::Address`]-reachable
//! pipeline node presents to the world.
//!
//! Association handling runs on `dicom-ul`'s async server API
//! (`establish_async`), one Tokio task per accepted TCP connection, mirroring
//! the reference `storescp` example's PDU loop: accumulate `Data` PDVs,
//! decode the accompanying `Command` PDV to learn the affected SOP Class/
//! Instance UID, then hand the fully reassembled dataset to a
//! [`StoreHandler`] supplied by the embedding pipeline node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dicom_core::{dicom_value, DataElement, VR};
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use dicom_transfer_syntax_registry::entries::IMPLICIT_VR_LITTLE_ENDIAN;
use dicom_transfer_syntax_registry::TransferSyntaxRegistry;
use dicom_ul::association::server::ServerAssociationOptions;
use dicom_ul::pdu::PDataValueType;
use dicom_ul::Pdu;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::DimseConfig;
use crate::types::status;
use crate::{DimseError, Result};

/// Invoked once per fully-received C-STORE-RQ. Implementations decide the
/// response status (see [`crate::types::status`]); the SCP takes care of
/// building and sending the C-STORE-RSP.
#[async_trait]
pub trait StoreHandler: Send + Sync {
    /// `calling_ae` is the AE title the peer association presented.
    async fn handle_store(&self, calling_ae: &str, object: InMemDicomObject) -> u16;
}

/// DIMSE Service Class Provider for C-STORE.
pub struct DimseScp {
    config: DimseConfig,
    handler: Arc<dyn StoreHandler>,
    active_associations: Arc<AtomicU32>,
}

impl DimseScp {
    pub fn new(config: DimseConfig, handler: Arc<dyn StoreHandler>) -> Self {
        Self {
            config,
            handler,
            active_associations: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Currently-open association count, used by callers that need to drain
    /// before reporting shutdown complete.
    pub fn active_associations(&self) -> u32 {
        self.active_associations.load(Ordering::SeqCst)
    }

    /// Run the accept loop until `shutdown` is cancelled. New associations
    /// stop being accepted immediately; in-flight ones are allowed to drain.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::new(self.config.bind_addr, self.config.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            "DIMSE SCP listening on {} (AET: {})",
            addr, self.config.local_aet
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("DIMSE SCP accept loop stopping, draining in-flight associations");
                    while self.active_associations.load(Ordering::SeqCst) > 0 {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                    info!("DIMSE SCP drained, all associations closed");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("Error accepting connection: {}", e);
                            continue;
                        }
                    };

                    if self.active_associations.load(Ordering::SeqCst) >= self.config.max_associations {
                        warn!("Maximum associations reached, rejecting connection from {}", peer_addr);
                        drop(stream);
                        continue;
                    }

                    let scp = Arc::clone(&self);
                    tokio::spawn(async move {
                        scp.active_associations.fetch_add(1, Ordering::SeqCst);
                        if let Err(e) = scp.handle_association(stream, peer_addr).await {
                            error!("Error handling association from {}: {}", peer_addr, e);
                        }
                        scp.active_associations.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }
    }

    async fn handle_association(
        &self,
        stream: tokio::net::TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<()> {
        let mut options = ServerAssociationOptions::new()
            .accept_any()
            .ae_title(&self.config.local_aet)
            .max_pdu_length(self.config.max_pdu);

        for ts in TransferSyntaxRegistry.iter() {
            if !ts.is_unsupported() {
                options = options.with_transfer_syntax(ts.uid());
            }
        }
        for sop_class in &self.config.accepted_sop_classes {
            options = options.with_abstract_syntax(sop_class.clone());
        }

        let mut association = match options.establish_async(stream).await {
            Ok(assoc) => assoc,
            Err(e) => {
                warn!("Association from {} rejected: {}", peer_addr, e);
                return Err(DimseError::AssociationRejected(e.to_string()));
            }
        };

        let calling_ae = association.client_ae_title().to_string();
        if !self.config.require_calling_aet.is_empty()
            && !self.config.require_calling_aet.contains(&calling_ae)
        {
            warn!(
                "Rejecting association from disallowed calling AE '{}'",
                calling_ae
            );
            let _ = association.abort().await;
            return Err(DimseError::AssociationRejected(format!(
                "calling AE '{calling_ae}' not permitted"
            )));
        }

        info!("Association established with {} ({})", peer_addr, calling_ae);

        let mut instance_buffer: Vec<u8> = Vec::with_capacity(1024 * 1024);
        let mut sop_class_uid = String::new();
        let mut sop_instance_uid = String::new();
        let mut message_id: u16 = 1;

        loop {
            let pdu = match association.receive().await {
                Ok(pdu) => pdu,
                Err(e) => {
                    debug!("Association with {} ended: {}", peer_addr, e);
                    break;
                }
            };

            match pdu {
                Pdu::PData { data } => {
                    for value in data {
                        match value.value_type {
                            PDataValueType::Command => {
                                let command = InMemDicomObject::read_dataset_with_ts(
                                    &value.data[..],
                                    &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                                );
                                if let Ok(command) = command {
                                    if let Ok(Some(elem)) =
                                        command.element_opt(tags::AFFECTED_SOP_CLASS_UID)
                                    {
                                        sop_class_uid =
                                            elem.to_str().unwrap_or_default().trim().to_string();
                                    }
                                    if let Ok(Some(elem)) =
                                        command.element_opt(tags::AFFECTED_SOP_INSTANCE_UID)
                                    {
                                        sop_instance_uid =
                                            elem.to_str().unwrap_or_default().trim().to_string();
                                    }
                                    if let Ok(Some(elem)) = command.element_opt(tags::MESSAGE_ID) {
                                        message_id = elem.to_int().unwrap_or(1);
                                    }
                                }
                            }
                            PDataValueType::Data => {
                                instance_buffer.extend_from_slice(&value.data);
                                if value.is_last {
                                    let pc = association
                                        .presentation_contexts()
                                        .iter()
                                        .find(|pc| pc.id == value.presentation_context_id)
                                        .cloned();
                                    let ts = pc
                                        .as_ref()
                                        .and_then(|pc| TransferSyntaxRegistry.get(&pc.transfer_syntax))
                                        .unwrap_or_else(|| IMPLICIT_VR_LITTLE_ENDIAN.erased());

                                    let status_code = match InMemDicomObject::read_dataset_with_ts(
                                        &instance_buffer[..],
                                        &ts,
                                    ) {
                                        Ok(object) => self.handler.handle_store(&calling_ae, object).await,
                                        Err(e) => {
                                            warn!("Failed to decode incoming dataset: {}", e);
                                            status::MISSING_ATTRIBUTE
                                        }
                                    };

                                    instance_buffer.clear();

                                    let response = build_store_response(
                                        &sop_class_uid,
                                        &sop_instance_uid,
                                        message_id,
                                        status_code,
                                    );
                                    let mut response_data = Vec::with_capacity(128);
                                    if response
                                        .write_dataset_with_ts(
                                            &mut response_data,
                                            &IMPLICIT_VR_LITTLE_ENDIAN.erased(),
                                        )
                                        .is_ok()
                                    {
                                        let pdu = Pdu::PData {
                                            data: vec![dicom_ul::pdu::PDataValue {
                                                presentation_context_id: value.presentation_context_id,
                                                value_type: PDataValueType::Command,
                                                is_last: true,
                                                data: response_data,
                                            }],
                                        };
                                        if let Err(e) = association.send(&pdu).await {
                                            warn!("Failed to send C-STORE-RSP: {}", e);
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
                Pdu::ReleaseRQ => {
                    let _ = association.send(&Pdu::ReleaseRP).await;
                    break;
                }
                Pdu::AbortRQ { .. } => {
                    debug!("Association aborted by {}", peer_addr);
                    break;
                }
                other => {
                    debug!("Ignoring unexpected PDU from {}: {:?}", peer_addr, other);
                }
            }
        }

        info!("Association with {} completed", peer_addr);
        Ok(())
    }
}

fn build_store_response(
    sop_class_uid: &str,
    sop_instance_uid: &str,
    message_id: u16,
    status_code: u16,
) -> InMemDicomObject {
    InMemDicomObject::command_from_element_iter([
        DataElement::new(
            tags::AFFECTED_SOP_CLASS_UID,
            VR::UI,
            dicom_value!(Str, sop_class_uid),
        ),
        DataElement::new(tags::COMMAND_FIELD, VR::US, dicom_value!(U16, [0x8001])),
        DataElement::new(
            tags::MESSAGE_ID_BEING_RESPONDED_TO,
            VR::US,
            dicom_value!(U16, [message_id]),
        ),
        DataElement::new(
            tags::COMMAND_DATA_SET_TYPE,
            VR::US,
            dicom_value!(U16, [0x0101]),
        ),
        DataElement::new(tags::STATUS, VR::US, dicom_value!(U16, [status_code])),
        DataElement::new(
            tags::AFFECTED_SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, sop_instance_uid),
        ),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use dicom_object::{FileDicomObject, FileMetaTableBuilder};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::Mutex as AsyncMutex;

    #[test]
    fn response_carries_status() {
        let response = build_store_response("1.2.3", "4.5.6", 9, status::MISSING_ATTRIBUTE);
        let status = response
            .element(tags::STATUS)
            .unwrap()
            .to_int::<u16>()
            .unwrap();
        assert_eq!(status, status::MISSING_ATTRIBUTE);
    }

    /// Reserve an ephemeral loopback port by binding and immediately
    /// releasing it; good enough for a short-lived test association.
    fn free_loopback_port() -> u16 {
        let listener = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        listener.local_addr().unwrap().port()
    }

    fn test_object() -> FileDicomObject<InMemDicomObject> {
        let meta = FileMetaTableBuilder::new()
            .media_storage_sop_class_uid("1.2.840.10008.5.1.4.1.1.7")
            .media_storage_sop_instance_uid("1.2.3.4.5")
            .transfer_syntax(IMPLICIT_VR_LITTLE_ENDIAN.uid())
            .build()
            .unwrap();
        InMemDicomObject::new_empty().with_exact_meta(meta)
    }

    #[derive(Default)]
    struct RecordingHandler {
        called_with: AsyncMutex<Option<String>>,
        response_status: AtomicU32,
    }

    impl RecordingHandler {
        fn returning(status_code: u16) -> Self {
            Self {
                called_with: AsyncMutex::new(None),
                response_status: AtomicU32::new(status_code as u32),
            }
        }

        async fn calling_ae(&self) -> Option<String> {
            self.called_with.lock().await.clone()
        }
    }

    #[async_trait]
    impl StoreHandler for RecordingHandler {
        async fn handle_store(&self, calling_ae: &str, _object: InMemDicomObject) -> u16 {
            *self.called_with.lock().await = Some(calling_ae.to_string());
            self.response_status.load(Ordering::SeqCst) as u16
        }
    }

    async fn wait_for_port(port: u16) {
        for _ in 0..100 {
            if tokio::net::TcpStream::connect((Ipv4Addr::LOCALHOST, port))
                .await
                .is_ok()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("SCP never started listening on port {port}");
    }

    #[tokio::test]
    async fn disallowed_calling_aet_rejects_the_association() {
        let port = free_loopback_port();
        let config = DimseConfig {
            local_aet: "LOCAL_SCP".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            require_calling_aet: vec!["ONLY_THIS_AE".to_string()],
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::returning(status::SUCCESS));
        let scp = Arc::new(DimseScp::new(config, handler.clone() as Arc<dyn StoreHandler>));
        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(scp.clone().run(shutdown.clone()));
        wait_for_port(port).await;

        let address = crate::types::Address::new("127.0.0.1".to_string(), port, "LOCAL_SCP".to_string());
        let result = crate::scu::send_image("SOME_OTHER_AE".to_string(), address, test_object()).await;

        assert!(result.is_err());
        assert_eq!(handler.calling_ae().await, None);

        shutdown.cancel();
        let _ = run_handle.await;
    }

    #[tokio::test]
    async fn allowed_calling_aet_completes_a_c_store_round_trip() {
        let port = free_loopback_port();
        let config = DimseConfig {
            local_aet: "LOCAL_SCP".to_string(),
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            ..Default::default()
        };
        let handler = Arc::new(RecordingHandler::returning(status::SUCCESS));
        let scp = Arc::new(DimseScp::new(config, handler.clone() as Arc<dyn StoreHandler>));
        let shutdown = CancellationToken::new();
        let run_handle = tokio::spawn(scp.clone().run(shutdown.clone()));
        wait_for_port(port).await;

        let address = crate::types::Address::new("127.0.0.1".to_string(), port, "LOCAL_SCP".to_string());
        let result = crate::scu::send_image("PEER_SCU".to_string(), address, test_object()).await;

        assert_eq!(result.unwrap(), status::SUCCESS);
        assert_eq!(handler.calling_ae().await, Some("PEER_SCU".to_string()));

        shutdown.cancel();
        let _ = run_handle.await;
    }
}
