//! The worker runtime: executes exactly one job, then exits.
//!
//! A worker is handed one duplex channel at startup. It sends a handshake
//! carrying its pid, waits for the single `submit` order, resolves the
//! payload's function name against the [`JobRegistry`], runs the handler,
//! and sends exactly one terminal message: `result` on success, `exception`
//! on any failure, including a handler panic. Exiting without a terminal
//! message is the crash case the scheduler detects as channel EOF.

pub mod registry;
pub mod shell;

pub use registry::{JobHandler, JobRegistry};

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::codec;
use crate::error::{ForemanError, Result};
use crate::protocol::{
    JobCall, JobFailure, Progress, WorkerMessage, WorkerOrder, KIND_BAD_ARGUMENTS, KIND_PANIC,
    KIND_UNKNOWN_JOB,
};

/// Side channels available to a running job body. Progress and notifications
/// are fire-and-forget: they never wait for an acknowledgement.
#[derive(Clone)]
pub struct JobContext {
    outbox: mpsc::UnboundedSender<WorkerMessage>,
}

impl JobContext {
    pub(crate) fn new(outbox: mpsc::UnboundedSender<WorkerMessage>) -> Self {
        Self { outbox }
    }

    pub fn report_progress(&self, value: Option<u64>, maximum: Option<u64>, status: Option<&str>) {
        let _ = self.outbox.send(WorkerMessage::Progress(Progress {
            value,
            maximum,
            status: status.map(str::to_string),
        }));
    }

    pub fn notify(&self, message: &str, title: Option<&str>, icon: Option<&str>, sticky: bool) {
        let _ = self.outbox.send(WorkerMessage::Notify {
            message: message.to_string(),
            title: title.map(str::to_string),
            icon: icon.map(str::to_string),
            sticky,
        });
    }
}

/// Run the worker runtime over the given channel until its one job is done.
pub async fn run<R, W>(reader: R, writer: W, registry: Arc<JobRegistry>) -> Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<WorkerMessage>();

    let writer_task = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbox_rx.recv().await {
            if let Err(e) = codec::write_frame(&mut writer, &message).await {
                tracing::warn!(error = %e, "Worker channel write failed");
                break;
            }
        }
    });

    let _ = outbox_tx.send(WorkerMessage::Handshake {
        pid: std::process::id(),
    });

    let mut reader = reader;
    let order = codec::read_frame::<_, WorkerOrder>(&mut reader).await?;
    let Some(WorkerOrder::Submit { id, payload }) = order else {
        return Err(ForemanError::Protocol(
            "channel closed before a job was submitted".to_string(),
        ));
    };
    tracing::debug!(job_id = %id, "Job received");

    let terminal = execute(payload, JobContext::new(outbox_tx.clone()), &registry).await;
    let _ = outbox_tx.send(terminal);

    // Close the outbox and let the writer drain everything, terminal message
    // included, before the process goes away.
    drop(outbox_tx);
    let _ = writer_task.await;
    Ok(())
}

/// Run the payload to a single terminal message. Every failure path ends in
/// an `Exception`, never a crash of the channel.
async fn execute(
    payload: Vec<u8>,
    ctx: JobContext,
    registry: &Arc<JobRegistry>,
) -> WorkerMessage {
    let call: JobCall = match bincode::deserialize(&payload) {
        Ok(call) => call,
        Err(e) => {
            return WorkerMessage::Exception {
                failure: JobFailure::new(KIND_BAD_ARGUMENTS, format!("undecodable payload: {e}")),
            }
        }
    };

    let Some(handler) = registry.get(&call.func) else {
        return WorkerMessage::Exception {
            failure: JobFailure::new(
                KIND_UNKNOWN_JOB,
                format!("no job registered as {:?}", call.func),
            ),
        };
    };

    tracing::debug!(func = %call.func, "Invoking job handler");
    let outcome = tokio::spawn(async move { handler.run(ctx, call.args).await }).await;
    match outcome {
        Ok(Ok(value)) => WorkerMessage::Result { value },
        Ok(Err(failure)) => WorkerMessage::Exception { failure },
        Err(join_error) => {
            let failure = if join_error.is_panic() {
                JobFailure::new(KIND_PANIC, panic_message(join_error.into_panic()))
            } else {
                JobFailure::new(KIND_PANIC, "job task was cancelled")
            };
            WorkerMessage::Exception { failure }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "job handler panicked".to_string()
    }
}
