//! EngineHandle - public interface for interacting with the engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use super::types::{
    EngineCommand, EngineCounters, EngineError, EngineStats, GenerationRequest,
    GenerationResult, ImageGenerator,
};

/// Handle to the generation engine, cloneable for sharing across tasks.
#[derive(Clone)]
pub struct EngineHandle {
    pub(crate) cmd_tx: mpsc::Sender<EngineCommand>,
    pub(crate) counters: Arc<EngineCounters>,
}

/// Sets the request's cancel flag unless disarmed, so a caller that stops
/// waiting also stops the worker at its next scale boundary.
struct CancelOnDrop {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl CancelOnDrop {
    fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(true, Ordering::Release);
        }
    }
}

impl EngineHandle {
    /// Submit a generation request and wait for the images.
    ///
    /// Fails fast with `NotReady` before a generator is installed and with
    /// `QueueFull` when `max_queue_depth` requests are already waiting.
    /// Dropping the returned future cancels the request.
    pub async fn generate(
        &self,
        request: GenerationRequest,
    ) -> Result<GenerationResult, EngineError> {
        if !self.is_ready() {
            EngineCounters::bump(&self.counters.rejected);
            return Err(EngineError::NotReady);
        }

        let cancel = Arc::new(AtomicBool::new(false));
        let guard = CancelOnDrop::new(Arc::clone(&cancel));
        let (resp_tx, resp_rx) = oneshot::channel();
        let command = EngineCommand::Generate {
            request,
            cancel,
            response_tx: resp_tx,
        };
        match self.cmd_tx.try_send(command) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                EngineCounters::bump(&self.counters.rejected);
                guard.disarm();
                return Err(EngineError::QueueFull);
            }
            Err(TrySendError::Closed(_)) => {
                guard.disarm();
                return Err(EngineError::Shutdown);
            }
        }

        let result = resp_rx.await.map_err(|_| EngineError::Shutdown)?;
        guard.disarm();
        result
    }

    /// Make `generator` serve subsequent requests.
    pub async fn install(&self, generator: Arc<dyn ImageGenerator>) -> Result<(), EngineError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        self.cmd_tx
            .send(EngineCommand::Install {
                generator,
                response_tx: resp_tx,
            })
            .await
            .map_err(|_| EngineError::Shutdown)?;
        resp_rx.await.map_err(|_| EngineError::Shutdown)
    }

    /// Shutdown the engine. Running generations finish; queued commands
    /// after this one are dropped.
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.cmd_tx
            .send(EngineCommand::Shutdown)
            .await
            .map_err(|_| EngineError::Shutdown)
    }

    pub fn is_ready(&self) -> bool {
        self.counters.ready.load(Ordering::Acquire)
    }

    /// Current engine statistics for monitoring.
    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }
}
