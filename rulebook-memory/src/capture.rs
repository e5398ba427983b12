//! Fire-and-forget capture of memories from agent activity.
//!
//! Callers enqueue a [`NewMemory`] without waiting; a background task saves
//! it. Nothing here ever reports a failure back to the caller. Input has not
//! been through privacy stripping yet, so log lines carry only the project.

use std::sync::Arc;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::manager::MemoryManager;
use crate::memory::NewMemory;

/// Handle for enqueueing captures; cheap to clone
#[derive(Clone)]
pub struct CaptureHook {
    tx: mpsc::Sender<NewMemory>,
}

impl CaptureHook {
    /// Start the background saver with a queue of `capacity` items.
    ///
    /// The task ends once every handle is dropped and the queue is drained.
    pub fn spawn(manager: Arc<MemoryManager>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = tokio::spawn(capture_task(manager, rx));
        (Self { tx }, worker)
    }

    /// Enqueue a memory. Returns `false` if it was dropped because the queue
    /// is full or the worker is gone.
    pub fn capture(&self, memory: NewMemory) -> bool {
        match self.tx.try_send(memory) {
            Ok(()) => true,
            Err(TrySendError::Full(memory)) => {
                warn!(project = %memory.project, "Capture queue full, dropping memory");
                false
            }
            Err(TrySendError::Closed(memory)) => {
                warn!(project = %memory.project, "Capture worker stopped, dropping memory");
                false
            }
        }
    }
}

async fn capture_task(manager: Arc<MemoryManager>, mut rx: mpsc::Receiver<NewMemory>) {
    while let Some(memory) = rx.recv().await {
        let project = memory.project.clone();
        match manager.save_memory(memory).await {
            Ok(record) => debug!(memory_id = %record.id, "Captured memory"),
            Err(e) => warn!(project = %project, error = %e, "Failed to capture memory"),
        }
    }
    debug!("Capture worker finished");
}
