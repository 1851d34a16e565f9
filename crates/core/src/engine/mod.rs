//! Generation engine: the boundary between async callers and blocking
//! tensor work.
//!
//! # Architecture
//!
//! - A single engine loop owns the command receiver. The channel is bounded
//!   by `max_queue_depth`; [`EngineHandle::generate`] uses `try_send`, so a
//!   full queue is reported immediately as `QueueFull`.
//! - Each request waits for one of `num_workers` semaphore permits and then
//!   runs on a blocking thread via `spawn_blocking`.
//! - Requests carry a cancel flag that the handle raises when the caller's
//!   future is dropped; generators check it between scales.
//!
//! Every generation call owns its own attention cache, so workers share one
//! generator without locking.
//!
//! # Example
//!
//! ```ignore
//! let handle = start_engine(EngineConfig::default());
//! handle.install(Arc::new(pipeline)).await?;
//! let result = handle.generate(GenerationRequest::single("a red bus", config)).await?;
//! ```

mod handle;
mod types;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, info_span, warn};

use crate::generation::GenerationError;

pub use handle::EngineHandle;
pub use types::{
    EngineConfig, EngineError, EngineStats, GenerationRequest, GenerationResult, ImageGenerator,
};

use types::{EngineCommand, EngineCounters};

/// Spawn the engine loop without a generator. Requests fail with `NotReady`
/// until [`EngineHandle::install`] completes.
///
/// Must be called from within a tokio runtime.
pub fn start_engine(config: EngineConfig) -> EngineHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(config.max_queue_depth.max(1));
    let counters = Arc::new(EngineCounters::default());
    tokio::spawn(run_engine_loop(config, Arc::clone(&counters), cmd_rx));
    EngineHandle { cmd_tx, counters }
}

/// Spawn the engine loop and install `generator` before returning.
pub async fn start_engine_with(
    generator: Arc<dyn ImageGenerator>,
    config: EngineConfig,
) -> Result<EngineHandle, EngineError> {
    let handle = start_engine(config);
    handle.install(generator).await?;
    Ok(handle)
}

async fn run_engine_loop(
    config: EngineConfig,
    counters: Arc<EngineCounters>,
    mut cmd_rx: mpsc::Receiver<EngineCommand>,
) {
    let semaphore = Arc::new(Semaphore::new(config.num_workers.max(1)));
    let mut generator: Option<Arc<dyn ImageGenerator>> = None;
    info!(
        num_workers = config.num_workers,
        max_queue_depth = config.max_queue_depth,
        "engine started"
    );

    while let Some(cmd) = cmd_rx.recv().await {
        match cmd {
            EngineCommand::Install {
                generator: installed,
                response_tx,
            } => {
                info!(
                    max_batch_size = installed.max_batch_size(),
                    "generator installed"
                );
                generator = Some(installed);
                counters.ready.store(true, Ordering::Release);
                let _ = response_tx.send(());
            }
            EngineCommand::Generate {
                request,
                cancel,
                response_tx,
            } => {
                let Some(generator) = generator.clone() else {
                    EngineCounters::bump(&counters.rejected);
                    let _ = response_tx.send(Err(EngineError::NotReady));
                    continue;
                };
                // Holding the loop here keeps later requests in the bounded
                // channel, which is what makes `QueueFull` observable.
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    let _ = response_tx.send(Err(EngineError::Shutdown));
                    break;
                };
                if cancel.load(Ordering::Acquire) {
                    EngineCounters::bump(&counters.cancelled);
                    debug!("request cancelled while queued");
                    let _ = response_tx.send(Err(GenerationError::Cancelled { scale: 0 }.into()));
                    continue;
                }
                counters.in_flight.fetch_add(1, Ordering::Relaxed);
                tokio::spawn(run_request(
                    generator,
                    request,
                    cancel,
                    permit,
                    Arc::clone(&counters),
                    response_tx,
                ));
            }
            EngineCommand::Shutdown => {
                info!("engine shutting down");
                counters.ready.store(false, Ordering::Release);
                break;
            }
        }
    }
}

async fn run_request(
    generator: Arc<dyn ImageGenerator>,
    request: GenerationRequest,
    cancel: Arc<AtomicBool>,
    permit: OwnedSemaphorePermit,
    counters: Arc<EngineCounters>,
    response_tx: oneshot::Sender<Result<GenerationResult, EngineError>>,
) {
    let start = Instant::now();
    let span = info_span!("engine_request", prompts = request.prompts.len());
    let joined = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        let _enter = span.enter();
        generator.generate(&request, &cancel)
    })
    .await;

    let result = match joined {
        Ok(Ok(images)) => {
            EngineCounters::bump(&counters.completed);
            Ok(GenerationResult {
                images,
                elapsed: start.elapsed(),
            })
        }
        Ok(Err(GenerationError::Cancelled { scale })) => {
            EngineCounters::bump(&counters.cancelled);
            debug!(scale, "request cancelled");
            Err(GenerationError::Cancelled { scale }.into())
        }
        Ok(Err(e)) => {
            EngineCounters::bump(&counters.failed);
            warn!(error = %e, "generation failed");
            Err(e.into())
        }
        Err(join_err) => {
            EngineCounters::bump(&counters.failed);
            error!(error = %join_err, "generation worker panicked");
            Err(EngineError::Worker(join_err.to_string()))
        }
    };
    counters.in_flight.fetch_sub(1, Ordering::Relaxed);
    let _ = response_tx.send(result);
}
