//! Dispatch strategies: how a ready patient slot is handed off to the
//! user's `process` function once [`crate::pipeline_tree::PipelineTree::ready`]
//! says it may run.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::error;

use crate::pipeline_tree::PatientSlot;

pub type DispatchFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
/// A dispatch closure: drive one patient slot's `process`/output lifecycle
/// to completion. Cloned cheaply (`Arc`) across every dispatch.
pub type DispatchFn = Arc<dyn Fn(String, PatientSlot) -> DispatchFuture + Send + Sync>;

/// How dispatched work is scheduled relative to the association that
/// admitted the last required dataset.
pub enum Dispatcher {
    /// Runs on the caller's own task: the association that completed the
    /// patient's inputs waits for `process`/output before accepting the
    /// next C-STORE-RQ. Simple, strictly ordered, no concurrency.
    Synchronous { dispatch: DispatchFn },
    /// Spawns a fresh Tokio task per dispatch. Unordered; a slow patient
    /// never blocks another's dispatch.
    Threaded {
        dispatch: DispatchFn,
        handles: Mutex<Vec<JoinHandle<()>>>,
    },
    /// A single background worker drains a FIFO queue one dispatch at a
    /// time, bounding concurrent `process` invocations to one.
    Queued {
        sender: Mutex<Option<mpsc::UnboundedSender<(String, PatientSlot)>>>,
        worker: Mutex<Option<JoinHandle<()>>>,
    },
}

impl Dispatcher {
    pub fn synchronous(dispatch: DispatchFn) -> Self {
        Dispatcher::Synchronous { dispatch }
    }

    pub fn threaded(dispatch: DispatchFn) -> Self {
        Dispatcher::Threaded {
            dispatch,
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn queued(dispatch: DispatchFn) -> Self {
        let (sender, mut receiver) = mpsc::unbounded_channel::<(String, PatientSlot)>();
        let worker = tokio::spawn(async move {
            while let Some((patient_id, slot)) = receiver.recv().await {
                dispatch(patient_id, slot).await;
            }
        });
        Dispatcher::Queued {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Hand a ready, just-extracted patient slot off for processing.
    pub async fn dispatch(&self, patient_id: String, slot: PatientSlot) {
        match self {
            Dispatcher::Synchronous { dispatch } => dispatch(patient_id, slot).await,
            Dispatcher::Threaded { dispatch, handles } => {
                let dispatch = dispatch.clone();
                let handle = tokio::spawn(async move { dispatch(patient_id, slot).await });
                handles.lock().await.push(handle);
            }
            Dispatcher::Queued { sender, .. } => {
                let guard = sender.lock().await;
                if let Some(sender) = guard.as_ref() {
                    if sender.send((patient_id, slot)).is_err() {
                        error!("queued dispatcher's worker has exited; dropping dispatch");
                    }
                } else {
                    error!("dispatch attempted after queued dispatcher was drained");
                }
            }
        }
    }

    /// Wait for every `Threaded` dispatch spawned so far to finish. No-op
    /// for the other strategies.
    pub async fn join_threads(&self) {
        if let Dispatcher::Threaded { handles, .. } = self {
            let mut handles = handles.lock().await;
            for handle in handles.drain(..) {
                if let Err(e) = handle.await {
                    error!("dispatched task panicked: {e}");
                }
            }
        }
    }

    /// Close the `Queued` FIFO and wait for its worker to drain everything
    /// already enqueued. No-op for the other strategies.
    pub async fn drain(&self) {
        if let Dispatcher::Queued { sender, worker } = self {
            sender.lock().await.take();
            if let Some(handle) = worker.lock().await.take() {
                if let Err(e) = handle.await {
                    error!("queued dispatcher's worker panicked: {e}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn empty_slot() -> PatientSlot {
        PatientSlot {
            header: None,
            inputs: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn synchronous_runs_inline() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let dispatcher = Dispatcher::synchronous(Arc::new(move |_id, _slot| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));
        dispatcher.dispatch("P1".to_string(), empty_slot()).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn threaded_join_waits_for_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let counter_clone = counter.clone();
        let dispatcher = Dispatcher::threaded(Arc::new(move |_id, _slot| {
            let counter = counter_clone.clone();
            Box::pin(async move {
                tokio::task::yield_now().await;
                counter.fetch_add(1, Ordering::SeqCst);
            })
        }));
        for _ in 0..5 {
            dispatcher.dispatch("P1".to_string(), empty_slot()).await;
        }
        dispatcher.join_threads().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn queued_drain_processes_fifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let order_clone = order.clone();
        let dispatcher = Dispatcher::queued(Arc::new(move |id, _slot| {
            let order = order_clone.clone();
            Box::pin(async move {
                order.lock().await.push(id);
            })
        }));
        dispatcher.dispatch("P1".to_string(), empty_slot()).await;
        dispatcher.dispatch("P2".to_string(), empty_slot()).await;
        dispatcher.drain().await;
        assert_eq!(*order.lock().await, vec!["P1".to_string(), "P2".to_string()]);
    }
}
