//! Pipeline node (`dicomnode.server.nodes.AbstractPipeline`): the SCP front
//! end that ties the pipeline tree, dispatcher, and output adapter into one
//! [`dimse::StoreHandler`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use dicom_dictionary_std::tags;
use dicom_object::InMemDicomObject;
use tokio::sync::Mutex;
use tracing::{error, warn};

use dimse::{status, StoreHandler};

use crate::concurrency::{DispatchFn, Dispatcher};
use crate::container::InputContainer;
use crate::error::NodeError;
use crate::output::{DIMSEOutput, FileOutput, NoOutput, Output, OutputItem};
use crate::pipeline_tree::{Declaration, PatientSlot, PipelineTree};

/// User admission filter: `Ok(true)` admits, `Ok(false)` is a soft
/// rejection, `Err` a hard one — mirrors step 2 of the acceptance pipeline.
pub type FilterFn = Arc<dyn Fn(&InMemDicomObject) -> anyhow::Result<bool> + Send + Sync>;

/// User processing function: consumes a patient's ground inputs plus a
/// scoped working directory, produces the Datasets to hand to `output`.
pub type ProcessFn = Arc<
    dyn Fn(InputContainer, &std::path::Path) -> anyhow::Result<Vec<InMemDicomObject>> + Send + Sync,
>;

/// Derive a per-dataset relative target path for adapters (like
/// `FileOutput`) that route each output dataset independently, named after
/// its `SOPInstanceUID` (minted fresh if the dataset doesn't carry one).
fn default_target_path(dataset: &InMemDicomObject) -> PathBuf {
    let sop_instance_uid = dataset
        .element_opt(tags::SOP_INSTANCE_UID)
        .ok()
        .flatten()
        .and_then(|e| e.to_str().ok().map(|s| s.trim().to_string()))
        .unwrap_or_else(crate::dicom::gen_uid);
    PathBuf::from(format!("{sop_instance_uid}.dcm"))
}

/// Build the default `Output` adapter named by `config.output`, using
/// `calling_ae` as the local AE for a `Dimse` adapter's outbound C-STOREs.
fn output_from_config(config: &crate::config::OutputConfig, calling_ae: &str) -> Arc<dyn Output> {
    match config {
        crate::config::OutputConfig::None => Arc::new(NoOutput),
        crate::config::OutputConfig::File { directory } => Arc::new(FileOutput::new(directory.clone())),
        crate::config::OutputConfig::Dimse { ae_title, host, port } => Arc::new(DIMSEOutput::new(
            calling_ae.to_string(),
            dimse::Address::new(host.clone(), *port, ae_title.clone()),
        )),
    }
}

fn delete_patient_directory(storage_root: &Option<PathBuf>, patient_id: &str) {
    if let Some(root) = storage_root {
        let dir = root.join(patient_id);
        if dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&dir) {
                warn!("failed to remove patient directory {}: {e}", dir.display());
            }
        }
    }
}

fn build_dispatch(
    process: ProcessFn,
    output: Arc<dyn Output>,
    storage_root: Option<PathBuf>,
    processing_directory: PathBuf,
) -> DispatchFn {
    Arc::new(move |patient_id: String, slot: PatientSlot| {
        let process = process.clone();
        let output = output.clone();
        let storage_root = storage_root.clone();
        let processing_directory = processing_directory.clone();
        Box::pin(async move {
            let mut grounds = HashMap::with_capacity(slot.inputs.len());
            for (name, input) in &slot.inputs {
                match input.grind() {
                    Ok(ground) => {
                        grounds.insert(name.clone(), ground);
                    }
                    Err(e) => {
                        error!("grinder for input '{name}' failed for patient {patient_id}: {e}");
                        delete_patient_directory(&storage_root, &patient_id);
                        return;
                    }
                }
            }
            let container = InputContainer::new(slot.header.clone(), grounds);

            let patient_dir = processing_directory.join(&patient_id);
            if let Err(e) = std::fs::create_dir_all(&patient_dir) {
                warn!(
                    "could not create processing directory {}: {e}",
                    patient_dir.display()
                );
            }

            let outcome = process(container, &patient_dir);
            let _ = std::fs::remove_dir_all(&patient_dir);

            match outcome {
                Ok(datasets) => {
                    let items: Vec<OutputItem> = datasets
                        .into_iter()
                        .map(|dataset| (default_target_path(&dataset), dataset))
                        .collect();
                    if !output.send(&items).await {
                        error!("Encountered error in user function output.send (patient {patient_id})");
                    }
                }
                Err(e) => {
                    let err = NodeError::user_function("process", e);
                    error!(
                        "Encountered error in user function process (patient {patient_id}): {err}"
                    );
                }
            }

            delete_patient_directory(&storage_root, &patient_id);
        })
    })
}

/// The node itself: owns the pipeline tree, the configured dispatcher, and
/// the admission-time collaborators (`filter`, `process`, `output`).
pub struct PipelineNode {
    calling_ae: Arc<str>,
    require_calling_aet: Vec<String>,
    ip: std::net::IpAddr,
    port: u16,
    tree: Mutex<PipelineTree>,
    filter: Option<FilterFn>,
    dispatcher: Dispatcher,
}

impl PipelineNode {
    /// Build a node from `config`. `config.logging` is installed immediately
    /// (a second call elsewhere is a harmless no-op). `output` overrides
    /// `config.output`'s adapter when supplied; otherwise one is constructed
    /// from `config.output` (`OutputConfig::None` yields [`NoOutput`]).
    pub fn new(
        config: crate::config::PipelineNodeConfig,
        declarations: BTreeMap<String, Declaration>,
        filter: Option<FilterFn>,
        process: ProcessFn,
        output: Option<Arc<dyn Output>>,
    ) -> Self {
        config.logging.init();

        let calling_ae: Arc<str> = Arc::from(config.ae_title.as_str());
        let storage_root = config.root_data_directory.clone();
        let tree = PipelineTree::new(declarations, calling_ae.clone(), storage_root.clone());
        let output = output.unwrap_or_else(|| output_from_config(&config.output, &config.ae_title));
        let dispatch = build_dispatch(process, output, storage_root, config.processing_directory.clone());

        Self {
            calling_ae,
            require_calling_aet: config.require_calling_aet,
            ip: config.ip,
            port: config.port,
            tree: Mutex::new(tree),
            filter,
            dispatcher: Dispatcher::synchronous(dispatch),
        }
    }

    /// Swap in a `Threaded`/`Queued` dispatcher after construction. Kept
    /// separate from `new` so tests can default to `Synchronous`.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn calling_ae(&self) -> &str {
        &self.calling_ae
    }

    /// Wait for all in-flight dispatches to finish, whatever the configured
    /// strategy (no-op for `Synchronous`).
    pub async fn drain(&self) {
        self.dispatcher.join_threads().await;
        self.dispatcher.drain().await;
    }

    /// Bind a DIMSE C-STORE SCP on this node's configured address and run
    /// the accept loop until `shutdown` is cancelled. New associations stop
    /// being accepted as soon as `shutdown` fires; in-flight ones are
    /// allowed to drain before this returns (per §5 Cancellation).
    pub async fn serve(
        self: Arc<Self>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> crate::error::Result<()> {
        let dimse_config = dimse::DimseConfig {
            local_aet: self.calling_ae.to_string(),
            bind_addr: self.ip,
            port: self.port,
            require_calling_aet: self.require_calling_aet.clone(),
            ..Default::default()
        };
        let scp = Arc::new(dimse::DimseScp::new(dimse_config, self.clone() as Arc<dyn StoreHandler>));
        scp.run(shutdown).await.map_err(Into::into)
    }

    async fn required_tags_satisfied(&self, dataset: &InMemDicomObject) -> Result<(), NodeError> {
        let required = self.tree.lock().await.required_tags();
        for tag in required {
            if dataset.element_opt(tag).ok().flatten().is_none() {
                if tag == tags::PATIENT_ID {
                    return Err(NodeError::MissingPatientId);
                }
                return Err(NodeError::MissingAttribute(format!("{tag}")));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl StoreHandler for PipelineNode {
    async fn handle_store(&self, calling_ae: &str, dataset: InMemDicomObject) -> u16 {
        // `require_calling_aet` is enforced once, at association-establishment
        // time, by `DimseScp::handle_association`: a disallowed calling AE
        // never reaches `handle_store` in the real `serve()` path, so it is
        // not re-checked here.

        if let Some(filter) = &self.filter {
            match filter(&dataset) {
                Ok(true) => {}
                Ok(false) => return status::MISSING_ATTRIBUTE,
                Err(e) => {
                    let err = NodeError::user_function("filter", e);
                    error!("Encountered error in user function filter (from {calling_ae}): {err}");
                    return status::FILTER_REJECTED;
                }
            }
        }

        if let Err(e) = self.required_tags_satisfied(&dataset).await {
            warn!("admission from {calling_ae} rejected: {e}");
            return match e {
                NodeError::MissingPatientId => status::MISSING_PATIENT_ID,
                _ => status::MISSING_ATTRIBUTE,
            };
        }

        let patient_id = {
            let mut tree = self.tree.lock().await;
            match tree.admit(dataset) {
                Ok(id) => id,
                Err(NodeError::MissingPatientId) => return status::MISSING_PATIENT_ID,
                Err(_) => return status::MISSING_ATTRIBUTE,
            }
        };

        let ready_slot = {
            let mut tree = self.tree.lock().await;
            if tree.ready(&patient_id) {
                tree.extract(&patient_id)
            } else {
                None
            }
        };

        if let Some(slot) = ready_slot {
            self.dispatcher.dispatch(patient_id, slot).await;
        }

        status::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grinders::Grinder;
    use crate::input::InputDeclaration;
    use dicom_core::{dicom_value, DataElement, VR};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn dataset(patient: &str, instance: &str) -> InMemDicomObject {
        InMemDicomObject::from_element_iter([
            DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, patient)),
            DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, instance)),
        ])
    }

    fn node(processed: Arc<AtomicBool>) -> PipelineNode {
        let declaration = InputDeclaration::new(
            vec![tags::PATIENT_ID],
            Arc::new(|datasets: &[InMemDicomObject]| !datasets.is_empty()),
            Grinder::List,
        );
        let mut declarations = BTreeMap::new();
        declarations.insert("primary".to_string(), Declaration::Input(declaration));

        let process: ProcessFn = Arc::new(move |_container, _dir| {
            processed.store(true, Ordering::SeqCst);
            Ok(Vec::new())
        });

        let tmp = tempfile::tempdir().unwrap();
        let mut config = crate::config::PipelineNodeConfig::new("TEST_AET");
        config.processing_directory = tmp.path().to_path_buf();

        PipelineNode::new(config, declarations, None, process, Some(Arc::new(NoOutput)))
    }

    #[tokio::test]
    async fn missing_patient_id_is_rejected() {
        let node = node(Arc::new(AtomicBool::new(false)));
        let ds = InMemDicomObject::from_element_iter([DataElement::new(
            tags::SOP_INSTANCE_UID,
            VR::UI,
            dicom_value!(Str, "I1"),
        )]);
        let status = node.handle_store("PEER_AE", ds).await;
        assert_eq!(status, status::MISSING_PATIENT_ID);
    }

    #[tokio::test]
    async fn ready_patient_triggers_dispatch() {
        let processed = Arc::new(AtomicBool::new(false));
        let node = node(processed.clone());
        let status = node.handle_store("PEER_AE", dataset("P1", "I1")).await;
        assert_eq!(status, status::SUCCESS);
        assert!(processed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn output_config_file_is_wired_without_an_explicit_output() {
        let declaration = InputDeclaration::new(
            vec![tags::PATIENT_ID],
            Arc::new(|datasets: &[InMemDicomObject]| !datasets.is_empty()),
            Grinder::List,
        );
        let mut declarations = BTreeMap::new();
        declarations.insert("primary".to_string(), Declaration::Input(declaration));

        let process: ProcessFn = Arc::new(|_container, _dir| {
            Ok(vec![InMemDicomObject::from_element_iter([
                DataElement::new(tags::PATIENT_ID, VR::LO, dicom_value!(Str, "P1")),
                DataElement::new(tags::SOP_INSTANCE_UID, VR::UI, dicom_value!(Str, "I1")),
                DataElement::new(
                    tags::SOP_CLASS_UID,
                    VR::UI,
                    dicom_value!(Str, "1.2.840.10008.5.1.4.1.1.7"),
                ),
            ])])
        });

        let processing_tmp = tempfile::tempdir().unwrap();
        let output_tmp = tempfile::tempdir().unwrap();
        let mut config = crate::config::PipelineNodeConfig::new("TEST_AET");
        config.processing_directory = processing_tmp.path().to_path_buf();
        config.output = crate::config::OutputConfig::File {
            directory: output_tmp.path().to_path_buf(),
        };

        let node = PipelineNode::new(config, declarations, None, process, None);
        let status = node.handle_store("PEER_AE", dataset("P1", "I1")).await;
        assert_eq!(status, status::SUCCESS);
        assert!(output_tmp.path().join("I1.dcm").exists());
    }
}
