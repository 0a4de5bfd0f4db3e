//! Background synchronization for callers that must not wait on the index.
//!
//! Requests are queued on an unbounded channel and coalesced: when several
//! are waiting only the newest one runs. Outcomes are logged and published on
//! a watch channel, never returned to the requester.

use super::{IndexSynchronizer, SyncOptions};
use crate::error::SyncError;
use crate::indexer::TreeSource;
use crate::types::SyncReport;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A queued sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub reference: String,
    pub rebuild: bool,
}

impl SyncRequest {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            rebuild: false,
        }
    }
}

/// Latest state of the worker
#[derive(Debug, Clone, PartialEq)]
pub enum SyncStatus {
    Idle,
    Running { reference: String },
    Finished(Box<SyncReport>),
    Failed { reference: String, error: String },
}

/// Handle to the background sync task
pub struct SyncWorker {
    tx: mpsc::UnboundedSender<SyncRequest>,
    status: watch::Receiver<SyncStatus>,
    current: Arc<Mutex<CancellationToken>>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the worker on the current tokio runtime
    pub fn spawn(synchronizer: Arc<IndexSynchronizer>, source: Arc<dyn TreeSource>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (status_tx, status) = watch::channel(SyncStatus::Idle);
        let current = Arc::new(Mutex::new(CancellationToken::new()));
        let handle = tokio::spawn(run(synchronizer, source, rx, status_tx, current.clone()));
        Self {
            tx,
            status,
            current,
            handle,
        }
    }

    /// Queue a sync of `reference`; returns false once the worker has stopped
    pub fn request(&self, reference: impl Into<String>) -> bool {
        self.submit(SyncRequest::new(reference))
    }

    pub fn submit(&self, request: SyncRequest) -> bool {
        match self.tx.send(request) {
            Ok(()) => true,
            Err(mpsc::error::SendError(request)) => {
                tracing::warn!(
                    "Sync worker has stopped, dropping request for {}",
                    request.reference
                );
                false
            }
        }
    }

    /// Subscribe to status updates
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Abort the sync in progress, if any; queued requests still run
    pub fn cancel_current(&self) {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .cancel();
    }

    /// Process every queued request, then stop
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.handle.await {
            tracing::error!("Sync worker terminated abnormally: {}", e);
        }
    }
}

async fn run(
    synchronizer: Arc<IndexSynchronizer>,
    source: Arc<dyn TreeSource>,
    mut rx: mpsc::UnboundedReceiver<SyncRequest>,
    status: watch::Sender<SyncStatus>,
    current: Arc<Mutex<CancellationToken>>,
) {
    while let Some(mut request) = rx.recv().await {
        let mut coalesced = 0usize;
        while let Ok(newer) = rx.try_recv() {
            let rebuild = request.rebuild || newer.rebuild;
            request = newer;
            request.rebuild = rebuild;
            coalesced += 1;
        }
        if coalesced > 0 {
            tracing::debug!("Coalesced {} queued sync requests", coalesced);
        }

        // a cancellation only applies to the run it interrupted
        let cancel = CancellationToken::new();
        *current.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = cancel.clone();

        status.send_replace(SyncStatus::Running {
            reference: request.reference.clone(),
        });
        let options = SyncOptions {
            rebuild: request.rebuild,
            cancel: Some(cancel),
        };

        let next = match synchronizer
            .sync(source.clone(), &request.reference, &options)
            .await
        {
            Ok(report) => SyncStatus::Finished(Box::new(report)),
            Err(SyncError::Partial(report)) => {
                tracing::warn!(
                    "Background sync of {} committed with {} failed units",
                    request.reference,
                    report.failed.len()
                );
                SyncStatus::Failed {
                    reference: request.reference,
                    error: SyncError::Partial(report).to_string(),
                }
            }
            Err(e) => {
                tracing::warn!("Background sync of {} failed: {}", request.reference, e);
                SyncStatus::Failed {
                    reference: request.reference,
                    error: e.to_string(),
                }
            }
        };
        status.send_replace(next);
    }
    tracing::debug!("Sync worker stopped");
}
