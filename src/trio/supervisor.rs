//! Deadline, disconnect and panic supervision for one streamed request.
//!
//! [`supervise`] runs the request's work on its own task next to a watcher. The
//! watcher cancels the work when the deadline elapses or the client goes away.
//! Whatever happens, the channel receives at most one error and exactly one
//! terminal marker.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::trio::error::EngineError;
use crate::trio::stream::UpdateChannel;

const UNEXPECTED_ERROR: &str = "An unexpected error occurred";

/// Run `work` under `deadline`, reporting its failure into `channel`.
///
/// Returns the work's value when it succeeded. A timeout is reported as
/// "Request timeout exceeded"; a cancellation caused by a client disconnect is
/// not reported at all; a panic is reported as a generic error.
pub async fn supervise<B, T, F, Fut>(
    channel: Arc<UpdateChannel<B>>,
    deadline: Duration,
    work: F,
) -> Option<T>
where
    B: Serialize + Default + Send + 'static,
    T: Send + 'static,
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
{
    let cancel = CancellationToken::new();
    let worker = tokio::spawn(work(cancel.clone()));

    let watcher = {
        let channel = channel.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(deadline) => {
                    log::warn!("trio::supervisor: request exceeded {:?}, cancelling", deadline);
                    channel.report_error(EngineError::Timeout.client_message());
                    cancel.cancel();
                }
                _ = channel.closed() => {
                    log::info!("trio::supervisor: client disconnected, cancelling");
                    cancel.cancel();
                }
            }
        })
    };

    let result = match worker.await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(EngineError::Cancelled)) => None,
        Ok(Err(err)) => {
            log::error!("trio::supervisor: request failed: {}", err);
            channel.report_error(err.client_message());
            None
        }
        Err(join_err) => {
            log::error!("trio::supervisor: request worker panicked: {}", join_err);
            channel.report_error(UNEXPECTED_ERROR);
            None
        }
    };

    // Stops the watcher when the work finished on its own.
    cancel.cancel();
    if let Err(err) = watcher.await {
        log::error!("trio::supervisor: watcher task failed: {}", err);
    }
    channel.finish();
    result
}
